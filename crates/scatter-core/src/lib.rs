//! scatter-core: shared protocol library for the scatter distributed proxy.
//!
//! Provides the CBOR wire messages and codec, the Conn byte-stream
//! abstraction with its stream adapter, the duplex relay engine, the
//! telemetry broadcaster and event types, typed forwarding errors, and
//! trace-id plumbing shared by the hub and probe.

pub mod broadcast;
pub mod codec;
pub mod conn;
pub mod duplex;
pub mod error;
pub mod logging;
pub mod messages;
pub mod stream;
pub mod telemetry;
pub mod trace;

// Re-export commonly used items at crate root.
pub use broadcast::{Broadcaster, Subscription};
pub use conn::{AcceptFn, Conn, Dialer, Forwarder};
pub use duplex::duplex;
pub use error::{forward_kind, Error, ForwardError, ForwardErrorKind, Result};
pub use messages::{DialCode, Envelope, MsgType, Payload};
pub use telemetry::{ConnectionEvent, Publisher, TransferEvent};
pub use trace::{TraceId, TRACE_ID_HEADER};
