//! Full-duplex splicing between a public stream and a proxy channel
//!
//! Each direction is its own copy loop with a byte counter. Per the tunnel
//! lifecycle, both ends are torn down as soon as either direction finishes;
//! the counters keep exact totals for the metrics plane even when the other
//! direction is cut mid-transfer.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::framed::IoStream;

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Splice `public` and `backend` together until either direction returns.
///
/// Returns `(bytes_in, bytes_out)`: bytes moved public -> backend and
/// backend -> public. Replayed request-head bytes are written by the caller
/// before the splice starts and accounted for there.
pub async fn splice<P: IoStream, B: IoStream>(public: P, backend: B) -> (u64, u64) {
    let (mut public_read, mut public_write) = tokio::io::split(public);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let bytes_in = AtomicU64::new(0);
    let bytes_out = AtomicU64::new(0);

    {
        let inbound = copy_counting(&mut public_read, &mut backend_write, &bytes_in);
        let outbound = copy_counting(&mut backend_read, &mut public_write, &bytes_out);
        tokio::pin!(inbound);
        tokio::pin!(outbound);

        tokio::select! {
            _ = &mut inbound => {}
            _ = &mut outbound => {}
        }
    }

    let _ = backend_write.shutdown().await;
    let _ = public_write.shutdown().await;

    (bytes_in.load(Ordering::Relaxed), bytes_out.load(Ordering::Relaxed))
}

async fn copy_counting<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }
        }
    }
    let _ = writer.flush().await;
}
