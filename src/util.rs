use std::time::Instant;

use n0_error::{Result, StackResultExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub(crate) use self::prebuffered::Prebuffered;

mod prebuffered;

/// Byte stream trait object for relay-side sockets.
///
/// The relay accepts both plain TCP and TLS streams on the same port logic,
/// and parked exposer sockets move between tasks, so sockets are erased to a
/// boxed duplex stream once accepted.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub(crate) type BoxedIo = Box<dyn Io>;

/// Bidirectionally forward data between two reader/writer pairs.
///
/// Each writer is shut down once the opposite reader reaches EOF, so a
/// half-close on one side of a bound pair propagates to the other as a clean
/// FIN instead of holding the socket open.
pub(crate) async fn forward_bidi(
    client_recv: &mut (impl AsyncRead + Send + Unpin),
    client_send: &mut (impl AsyncWrite + Send + Unpin),
    exposer_recv: &mut (impl AsyncRead + Send + Unpin),
    exposer_send: &mut (impl AsyncWrite + Send + Unpin),
) -> Result<(u64, u64)> {
    let start = Instant::now();
    let (r1, r2) = tokio::join!(
        async {
            let res = tokio::io::copy(client_recv, exposer_send).await;
            exposer_send.shutdown().await.ok();
            trace!(?res, elapsed=?start.elapsed(), "forward client-to-exposer finished");
            res
        },
        async {
            let res = tokio::io::copy(exposer_recv, client_send).await;
            client_send.shutdown().await.ok();
            trace!(?res, elapsed=?start.elapsed(), "forward exposer-to-client finished");
            res
        }
    );
    let r1 = r1.context("failed to copy client-to-exposer")?;
    let r2 = r2.context("failed to copy exposer-to-client")?;
    Ok((r1, r2))
}
