/// Byte relays: unidirectional copy and the bidirectional coupling used for
/// steady-state tunnels, with a per-chunk inspection hook on the inbound
/// direction for session-ticket sniffing.
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Sized to a full TLS record (16 KiB) plus framing overhead.
pub const RELAY_BUF_SIZE: usize = 16 * 1024;

/// Copy `src` to `dst` until EOF or error. On EOF the peer's write side is
/// shut down so the reverse direction can drain to its own EOF.
pub async fn relay<R, W>(src: &mut R, dst: &mut W, label: &str) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            dst.shutdown().await.ok();
            tracing::debug!("{}: EOF after {} bytes", label, total);
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Couple two sockets bidirectionally. Every chunk flowing `b → a` is shown
/// to `inspector` before it is forwarded; the callback must not block.
///
/// EOF on one side half-closes the peer and lets the other direction finish;
/// any other error tears both directions down.
pub async fn bi_relay_with_inspection<F>(
    a: TcpStream,
    b: TcpStream,
    label_ab: &str,
    label_ba: &str,
    mut inspector: F,
) -> io::Result<(u64, u64)>
where
    F: FnMut(&[u8]),
{
    let (mut ar, mut aw) = a.into_split();
    let (mut br, mut bw) = b.into_split();

    let forward = relay(&mut ar, &mut bw, label_ab);

    let backward = async {
        let mut buf = vec![0u8; RELAY_BUF_SIZE];
        let mut total = 0u64;
        loop {
            let n = br.read(&mut buf).await?;
            if n == 0 {
                aw.shutdown().await.ok();
                tracing::debug!("{}: EOF after {} bytes", label_ba, total);
                return Ok(total);
            }
            inspector(&buf[..n]);
            aw.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    };

    tokio::try_join!(forward, backward)
}

/// Bidirectional relay without inspection, for plain direct tunnels.
pub async fn bi_relay(
    a: TcpStream,
    b: TcpStream,
    label_ab: &str,
    label_ba: &str,
) -> io::Result<(u64, u64)> {
    bi_relay_with_inspection(a, b, label_ab, label_ba, |_| {}).await
}
