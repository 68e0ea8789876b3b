/// Target-side plumbing: resolve and dial targets on behalf of clients,
/// and pump target responses into a session's FIFO queue.
use shroud_proto::session::Session;
use shroud_proto::tls;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout, Duration};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// A target that stays quiet this long ends its response pump.
const READ_DEADLINE: Duration = Duration::from_secs(30);
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

pub async fn resolve_target(host: &str, port: u16) -> io::Result<SocketAddr> {
    let mut addrs = lookup_host((host, port)).await?;
    addrs
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "DNS resolution failed"))
}

pub async fn open_target(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "target connect timeout"))??;
    stream.set_nodelay(true)?;
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
    Ok(stream)
}

/// Read target responses into the session queue until EOF, a quiet period,
/// an error, or session removal. Flags handshake completion and captures
/// session tickets along the way.
pub fn spawn_response_pump(session: Arc<Session>, mut target: OwnedReadHalf) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = tokio::select! {
                _ = session.closed() => break,
                read = timeout(READ_DEADLINE, target.read(&mut buf)) => match read {
                    Err(_) => {
                        tracing::debug!("session {}: target quiet, stopping pump", session.id());
                        break;
                    }
                    Ok(Err(e)) => {
                        tracing::debug!("session {}: target read failed: {}", session.id(), e);
                        break;
                    }
                    Ok(Ok(0)) => {
                        tracing::debug!("session {}: target EOF", session.id());
                        break;
                    }
                    Ok(Ok(n)) => n,
                },
            };
            let chunk = &buf[..n];

            if session.tls_version().is_none() {
                if let Ok(header) = tls::parse_record_header(chunk) {
                    session.set_tls_version(header.version);
                }
            }
            if tls::is_session_ticket(chunk) {
                session.set_session_ticket(chunk.to_vec());
            }
            if tls::is_handshake_complete(chunk) && session.mark_handshake_complete() {
                tracing::debug!("session {}: target handshake complete", session.id());
            }
            session.push_response(chunk.to_vec());
        }
    });
}
