//! Bidirectional byte relay between two [`Conn`]s with paired shutdown.
//!
//! Each direction copies independently; the first direction to finish
//! (end of stream or error) cancels the shared token, which unblocks the
//! other direction's pending I/O. Both write halves are shut down before
//! the call returns so each peer observes end of stream.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::conn::{Conn, ReadHalf, WriteHalf};
use crate::error::is_disconnect;

/// Copies bytes in both directions until either side closes, then releases
/// both connections.
pub async fn duplex(a: Conn, b: Conn) {
    let cancel = CancellationToken::new();
    let (mut a_read, mut a_write) = a.into_split();
    let (mut b_read, mut b_write) = b.into_split();

    tokio::join!(
        simplex(&mut a_read, &mut b_write, &cancel),
        simplex(&mut b_read, &mut a_write, &cancel),
    );
}

async fn simplex(from: &mut ReadHalf, to: &mut WriteHalf, cancel: &CancellationToken) {
    let result = tokio::select! {
        _ = cancel.cancelled() => None,
        result = from.read_to(to) => Some(result),
    };
    cancel.cancel();

    match result {
        None => debug!(
            from = from.name(),
            to = to.name(),
            "copy stopped by peer direction"
        ),
        Some(Ok(n)) => debug!(
            written_bytes = n,
            from = from.name(),
            to = to.name(),
            "copy finished"
        ),
        Some(Err(e)) if is_disconnect(&e) => debug!(
            from = from.name(),
            to = to.name(),
            error = %e,
            "copy ended by disconnect"
        ),
        Some(Err(e)) => error!(
            from = from.name(),
            to = to.name(),
            error = %e,
            "unexpected error while copying"
        ),
    }

    if let Err(e) = to.close().await {
        debug!(to = to.name(), error = %e, "failed to close write half");
    }
}
