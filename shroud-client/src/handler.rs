/// Per-connection state machine: peek the first bytes, classify the
/// protocol, pick a concealment strategy, and drive the handshake into a
/// steady-state relay.
use crate::oob::OobClient;
use crate::relay;
use rand::Rng;
use shroud_proto::api::{self, TargetInfo};
use shroud_proto::config::ConcealmentSettings;
use shroud_proto::ticket::TicketCache;
use shroud_proto::tls;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration, Instant};

/// First read covers a CONNECT request or a whole ClientHello.
const INITIAL_READ_LIMIT: usize = 4096;
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Pacing for the handshake-broker poll loop.
const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

// ── Shared state ─────────────────────────────────────────────────────

pub struct ProxyState {
    pub concealment: ConcealmentSettings,
    pub oob: OobClient,
    pub tickets: TicketCache,
}

// ── Listener loop ────────────────────────────────────────────────────

pub async fn run_proxy(listen_addr: String, state: Arc<ProxyState>) -> io::Result<()> {
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!("Proxy listening on {}", listen_addr);

    loop {
        let (client, client_addr) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(client, client_addr, state).await {
                log_tunnel_error(client_addr, &e);
            }
        });
    }
}

/// Triage per-connection failures: peers hanging up and malformed first
/// bytes are routine churn, timeouts and OOB failures deserve a warning.
fn log_tunnel_error(client_addr: SocketAddr, e: &io::Error) {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => {
            tracing::debug!("{}: connection ended early: {}", client_addr, e);
        }
        // Not a CONNECT and not a parseable ClientHello.
        io::ErrorKind::InvalidData => {
            tracing::debug!("{}: unrecognized initial bytes: {}", client_addr, e);
        }
        // Target dial or handshake-broker deadline.
        io::ErrorKind::TimedOut => {
            tracing::warn!("{}: tunnel timed out: {}", client_addr, e);
        }
        _ => {
            tracing::warn!("{}: tunnel failed: {}", client_addr, e);
        }
    }
}

// ── Classification ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialProtocol {
    HttpConnect,
    PlainHttp,
    DirectTls,
}

pub fn classify_initial(buf: &[u8]) -> InitialProtocol {
    if buf.starts_with(b"CONNECT ") {
        InitialProtocol::HttpConnect
    } else if buf.starts_with(b"GET ") || buf.starts_with(b"POST ") || buf.starts_with(b"HEAD ") {
        InitialProtocol::PlainHttp
    } else {
        InitialProtocol::DirectTls
    }
}

/// Pull `host:port` out of the CONNECT request line. Port defaults to 443.
pub fn parse_connect_target(buf: &[u8]) -> Option<(String, u16)> {
    let end = buf.windows(2).position(|w| w == b"\r\n").unwrap_or(buf.len());
    let line = std::str::from_utf8(&buf[..end]).ok()?;
    let mut parts = line.split_whitespace();
    if parts.next()? != "CONNECT" {
        return None;
    }
    let authority = parts.next()?;
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().ok()?;
            Some((host.to_string(), port))
        }
        None => Some((authority.to_string(), 443)),
    }
}

/// `{unix_nanos}-{8 random bytes as hex}` — unique per connection and not
/// guessable from the clock alone.
pub fn generate_session_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut entropy = [0u8; 8];
    rand::thread_rng().fill(&mut entropy);
    let hex: String = entropy.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", nanos, hex)
}

// ── Connection handling ──────────────────────────────────────────────

pub async fn handle_connection(
    mut client: TcpStream,
    client_addr: SocketAddr,
    state: Arc<ProxyState>,
) -> io::Result<()> {
    let mut initial = vec![0u8; INITIAL_READ_LIMIT];
    let n = client.read(&mut initial).await?;
    if n == 0 {
        return Ok(());
    }
    initial.truncate(n);

    match classify_initial(&initial) {
        InitialProtocol::PlainHttp => {
            tracing::debug!("{}: plain HTTP request, not proxied, closing", client_addr);
            Ok(())
        }
        InitialProtocol::HttpConnect => handle_connect(client, client_addr, &initial, state).await,
        InitialProtocol::DirectTls => {
            let sni = tls::extract_sni(&initial)?;
            tracing::info!("{} -> {}:443 [SNI: {}] direct TLS", client_addr, sni, sni);
            oob_tunnel(client, client_addr, initial, sni, 443, state).await
        }
    }
}

async fn handle_connect(
    mut client: TcpStream,
    client_addr: SocketAddr,
    initial: &[u8],
    state: Arc<ProxyState>,
) -> io::Result<()> {
    let (host, port) = parse_connect_target(initial)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed CONNECT request"))?;
    client.write_all(CONNECT_ESTABLISHED).await?;

    if !state.concealment.prioritize_sni {
        return direct_tunnel(client, client_addr, host, port, state).await;
    }

    // The tunnel is up; the next client bytes are the ClientHello.
    let hello = read_client_hello(&mut client).await?;
    let sni = tls::extract_sni(&hello).unwrap_or_else(|_| host.clone());
    tracing::info!("{} -> {}:{} [SNI: {}] CONNECT", client_addr, host, port, sni);
    oob_tunnel(client, client_addr, hello, sni, port, state).await
}

async fn read_client_hello(client: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut hello = vec![0u8; INITIAL_READ_LIMIT];
    let n = client.read(&mut hello).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "client closed before sending a ClientHello",
        ));
    }
    hello.truncate(n);
    Ok(hello)
}

// ── Direct tunnel ────────────────────────────────────────────────────

async fn direct_tunnel(
    mut client: TcpStream,
    client_addr: SocketAddr,
    host: String,
    port: u16,
    state: Arc<ProxyState>,
) -> io::Result<()> {
    match dial(&host, port).await {
        Ok(target) => {
            tracing::info!("{} -> {}:{} direct tunnel", client_addr, host, port);
            let inspector = ticket_inspector(&state, host.clone());
            relay::bi_relay_with_inspection(client, target, "client->target", "target->client", inspector)
                .await
                .map(|_| ())
        }
        Err(e) => {
            // The dial failed but the CONNECT is already acknowledged; the
            // ClientHello is on its way. Resolve through the OOB peer
            // instead and keep the connection alive.
            tracing::warn!(
                "{}: direct dial {}:{} failed ({}), falling back to OOB resolution",
                client_addr, host, port, e
            );
            let hello = read_client_hello(&mut client).await?;
            let sni = tls::extract_sni(&hello).unwrap_or_else(|_| host.clone());
            let session_id = generate_session_id();
            let result =
                sni_only_concealment(client, client_addr, &session_id, hello, &sni, port, &state).await;
            state.oob.release_connection(&session_id).await;
            result
        }
    }
}

// ── OOB tunnels ──────────────────────────────────────────────────────

async fn oob_tunnel(
    client: TcpStream,
    client_addr: SocketAddr,
    hello: Vec<u8>,
    sni: String,
    port: u16,
    state: Arc<ProxyState>,
) -> io::Result<()> {
    let session_id = generate_session_id();
    let result = if state.concealment.full_client_hello {
        full_concealment(client, client_addr, &session_id, hello, &sni, port, &state).await
    } else {
        sni_only_concealment(client, client_addr, &session_id, hello, &sni, port, &state).await
    };
    state.oob.release_connection(&session_id).await;
    result
}

/// Full ClientHello concealment: the hello and the whole early handshake
/// travel via the OOB peer; only after the handshake completes does this
/// host touch the target directly.
async fn full_concealment(
    mut client: TcpStream,
    client_addr: SocketAddr,
    session_id: &str,
    hello: Vec<u8>,
    sni: &str,
    port: u16,
    state: &Arc<ProxyState>,
) -> io::Result<()> {
    let info = state
        .oob
        .get_target_info(session_id, Some(&hello), sni, port)
        .await?;
    tracing::info!(
        "{} session {}: full concealment via OOB, target {}:{}",
        client_addr, session_id, info.target_ip, info.target_port
    );

    broker_handshake(&mut client, session_id, state).await?;
    state.oob.signal_handshake_complete(session_id).await?;

    let target = dial(&info.target_ip, info.target_port).await?;
    seed_ticket_cache(&state.tickets, &info);
    let inspector = ticket_inspector(state, info.target_host.clone());
    relay::bi_relay_with_inspection(client, target, "client->target", "target->client", inspector)
        .await
        .map(|_| ())
}

/// Shuttle handshake flights between the client and the OOB peer until a
/// target response carries Finished or ApplicationData. Completion is
/// detected by polling, never by sleeping a fixed interval.
async fn broker_handshake(
    client: &mut TcpStream,
    session_id: &str,
    state: &Arc<ProxyState>,
) -> io::Result<()> {
    let deadline = Instant::now() + Duration::from_millis(state.concealment.handshake_timeout_ms);
    let mut upload = vec![0u8; relay::RELAY_BUF_SIZE];

    loop {
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "handshake did not complete in time",
            ));
        }

        let (data, complete) = state.oob.get_response(session_id).await?;
        if !data.is_empty() {
            client.write_all(&data).await?;
            if tls::is_handshake_complete(&data) {
                return Ok(());
            }
        }
        if complete {
            return Ok(());
        }

        // Forward any pending client flight; the read timeout doubles as
        // the poll pacing.
        match timeout(RESPONSE_POLL_INTERVAL, client.read(&mut upload)).await {
            Ok(Ok(0)) => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "client closed during handshake",
                ))
            }
            Ok(Ok(n)) => state.oob.store_client_message(session_id, &upload[..n]).await?,
            Ok(Err(e)) => return Err(e),
            Err(_) => {} // nothing from the client this cycle
        }
    }
}

/// SNI-only concealment: the OOB peer resolves the target, the handshake
/// itself runs over the direct socket — with the server_name swapped for
/// the configured decoy when one is set.
async fn sni_only_concealment(
    client: TcpStream,
    client_addr: SocketAddr,
    session_id: &str,
    hello: Vec<u8>,
    sni: &str,
    port: u16,
    state: &Arc<ProxyState>,
) -> io::Result<()> {
    let info = state.oob.get_target_info(session_id, None, sni, port).await?;
    tracing::info!(
        "{} session {}: SNI-only concealment, target {}:{}",
        client_addr, session_id, info.target_ip, info.target_port
    );

    // A target_ip equal to the SNI is the direct transport's placeholder;
    // TcpStream::connect resolves hostnames and literal IPs alike.
    let mut target = dial(&info.target_ip, info.target_port).await?;

    let first_write = if state.concealment.fake_sni.is_empty() {
        hello
    } else {
        tls::rewrite_sni(&hello, &state.concealment.fake_sni)?
    };
    target.write_all(&first_write).await?;

    seed_ticket_cache(&state.tickets, &info);
    let inspector = ticket_inspector(state, info.target_host.clone());
    relay::bi_relay_with_inspection(client, target, "client->target", "target->client", inspector)
        .await
        .map(|_| ())
}

// ── Target sockets ───────────────────────────────────────────────────

async fn dial(host: &str, port: u16) -> io::Result<TcpStream> {
    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "target connect timeout"))??;
    tune_target_socket(&stream)?;
    Ok(stream)
}

/// No-delay plus keepalive, so resumed application data is not held back.
fn tune_target_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}

// ── Ticket sniffing ──────────────────────────────────────────────────

/// Inspection hook for the inbound relay direction: any NewSessionTicket
/// chunk is cached under the target hostname.
pub fn ticket_inspector(state: &Arc<ProxyState>, host: String) -> impl FnMut(&[u8]) {
    let state = Arc::clone(state);
    move |chunk: &[u8]| {
        if tls::is_session_ticket(chunk) {
            state.tickets.store(&host, chunk);
        }
    }
}

fn seed_ticket_cache(tickets: &TicketCache, info: &TargetInfo) {
    if let Some(encoded) = info.session_ticket.as_deref() {
        match api::decode(encoded) {
            Ok(data) => tickets.store(&info.target_host, &data),
            Err(e) => tracing::debug!("Undecodable session ticket for {}: {}", info.target_host, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_first_bytes() {
        assert_eq!(
            classify_initial(b"CONNECT example.com:443 HTTP/1.1\r\n"),
            InitialProtocol::HttpConnect
        );
        assert_eq!(classify_initial(b"GET / HTTP/1.1\r\n"), InitialProtocol::PlainHttp);
        assert_eq!(classify_initial(b"POST /x HTTP/1.1\r\n"), InitialProtocol::PlainHttp);
        assert_eq!(classify_initial(b"HEAD / HTTP/1.1\r\n"), InitialProtocol::PlainHttp);
        assert_eq!(classify_initial(&[0x16, 0x03, 0x01]), InitialProtocol::DirectTls);
        assert_eq!(classify_initial(b""), InitialProtocol::DirectTls);
    }

    #[test]
    fn parses_connect_request_line() {
        let req = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        assert_eq!(parse_connect_target(req), Some(("example.com".into(), 443)));

        let req = b"CONNECT example.com:8443 HTTP/1.1\r\n\r\n";
        assert_eq!(parse_connect_target(req), Some(("example.com".into(), 8443)));

        // No port: default 443.
        assert_eq!(
            parse_connect_target(b"CONNECT example.com HTTP/1.1\r\n\r\n"),
            Some(("example.com".into(), 443))
        );

        assert_eq!(parse_connect_target(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(parse_connect_target(b"CONNECT example.com:abc HTTP/1.1\r\n"), None);
    }

    #[test]
    fn session_ids_have_shape_and_entropy() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);

        let (nanos, entropy) = a.split_once('-').unwrap();
        assert!(nanos.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(entropy.len(), 16);
        assert!(entropy.chars().all(|c| c.is_ascii_hexdigit()));
        assert!((20..=40).contains(&a.len()), "id length {} out of range", a.len());
    }
}
