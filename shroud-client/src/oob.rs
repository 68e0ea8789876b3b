/// OOB peer transport: either in-process direct calls against a shared
/// session registry, or HTTP/JSON against a remote peer. Both expose the
/// same capability set, so the connection handler never cares which one it
/// is talking to.
use shroud_proto::api::{
    self, ResponsePayload, SessionRequest, StoreMessageRequest, TargetInfo, TargetInfoRequest,
    ACTION_COMPLETE_HANDSHAKE, ACTION_GET_TARGET_INFO, ACTION_RELEASE_CONNECTION,
    ACTION_STORE_CLIENT_MESSAGE,
};
use shroud_proto::session::SessionRegistry;
use shroud_proto::tls;
use std::io;
use std::sync::Arc;
use std::time::Duration;

const TARGET_INFO_TIMEOUT: Duration = Duration::from_secs(5);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(3);

// ── Transport selection ──────────────────────────────────────────────

pub enum OobClient {
    Direct(DirectOob),
    Http(HttpOob),
}

impl OobClient {
    /// In-process transport sharing the given registry with the rest of
    /// the process.
    pub fn direct(registry: Arc<SessionRegistry>) -> Self {
        OobClient::Direct(DirectOob { registry })
    }

    /// HTTP transport against `peer` (`host:port`).
    pub fn http(peer: &str) -> Self {
        OobClient::Http(HttpOob {
            base: format!("http://{}", peer),
            http: reqwest::Client::new(),
        })
    }

    /// Resolve the target for a session. A ClientHello initiates a brokered
    /// handshake on the peer; without one, `sni` drives resolution only.
    pub async fn get_target_info(
        &self,
        session_id: &str,
        client_hello: Option<&[u8]>,
        sni: &str,
        port: u16,
    ) -> io::Result<TargetInfo> {
        match self {
            OobClient::Direct(d) => d.get_target_info(session_id, client_hello, sni, port),
            OobClient::Http(h) => h.get_target_info(session_id, client_hello, sni, port).await,
        }
    }

    /// Dequeue one buffered target response plus the completion flag.
    pub async fn get_response(&self, session_id: &str) -> io::Result<(Vec<u8>, bool)> {
        match self {
            OobClient::Direct(d) => d.get_response(session_id),
            OobClient::Http(h) => h.get_response(session_id).await,
        }
    }

    /// Upload a post-ClientHello client flight for the peer to write to
    /// the target.
    pub async fn store_client_message(&self, session_id: &str, data: &[u8]) -> io::Result<()> {
        match self {
            OobClient::Direct(d) => d.store_client_message(session_id, data).await,
            OobClient::Http(h) => h.store_client_message(session_id, data).await,
        }
    }

    pub async fn signal_handshake_complete(&self, session_id: &str) -> io::Result<()> {
        match self {
            OobClient::Direct(d) => d.signal_handshake_complete(session_id),
            OobClient::Http(h) => h.signal_handshake_complete(session_id).await,
        }
    }

    /// Best-effort: failures are logged and swallowed, never fatal.
    pub async fn release_connection(&self, session_id: &str) {
        match self {
            OobClient::Direct(d) => d.release_connection(session_id).await,
            OobClient::Http(h) => h.release_connection(session_id).await,
        }
    }
}

// ── In-process transport ─────────────────────────────────────────────

pub struct DirectOob {
    registry: Arc<SessionRegistry>,
}

impl DirectOob {
    fn session(&self, session_id: &str) -> io::Result<Arc<shroud_proto::session::Session>> {
        self.registry
            .get(session_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such session"))
    }

    fn get_target_info(
        &self,
        session_id: &str,
        client_hello: Option<&[u8]>,
        sni: &str,
        port: u16,
    ) -> io::Result<TargetInfo> {
        let session = match self.registry.get(session_id) {
            Some(s) => s,
            None => self.registry.create(session_id, sni)?,
        };

        let mut sni = sni.to_string();
        if let Some(hello) = client_hello {
            if let Ok(extracted) = tls::extract_sni(hello) {
                sni = extracted;
            }
            session.set_sni(&sni);
            session.store_client_message(hello.to_vec());
        } else if sni.is_empty() {
            // Fall back to the buffered ClientHello, if any.
            if let Some(hello) = session.first_client_message() {
                if let Ok(extracted) = tls::extract_sni(&hello) {
                    sni = extracted;
                    session.set_sni(&sni);
                }
            }
        }
        session.set_target_addr(&sni, port);

        let tls_version = client_hello
            .and_then(|hello| tls::parse_record_header(hello).ok())
            .map(|h| h.version)
            .unwrap_or(0x0303);

        // target_ip carries the SNI here: the direct transport does no DNS,
        // the caller resolves the hostname itself.
        Ok(TargetInfo {
            target_host: sni.clone(),
            target_ip: sni.clone(),
            target_port: port,
            sni,
            session_ticket: session.session_ticket().map(|t| api::encode(&t)),
            master_secret: None,
            tls_version,
            alpn: None,
        })
    }

    fn get_response(&self, session_id: &str) -> io::Result<(Vec<u8>, bool)> {
        let session = self.session(session_id)?;
        let (data, complete) = session.get_response();
        Ok((data.unwrap_or_default(), complete))
    }

    async fn store_client_message(&self, session_id: &str, data: &[u8]) -> io::Result<()> {
        let session = self.session(session_id)?;
        session.store_client_message(data.to_vec());
        session.write_to_target(data).await
    }

    fn signal_handshake_complete(&self, session_id: &str) -> io::Result<()> {
        self.session(session_id)?.mark_handshake_complete();
        Ok(())
    }

    async fn release_connection(&self, session_id: &str) {
        self.registry.remove(session_id).await;
    }
}

// ── HTTP transport ───────────────────────────────────────────────────

pub struct HttpOob {
    base: String,
    http: reqwest::Client,
}

impl HttpOob {
    async fn get_target_info(
        &self,
        session_id: &str,
        client_hello: Option<&[u8]>,
        sni: &str,
        port: u16,
    ) -> io::Result<TargetInfo> {
        let request = TargetInfoRequest {
            session_id: session_id.to_string(),
            action: ACTION_GET_TARGET_INFO.to_string(),
            client_hello: client_hello.map(api::encode),
            sni: if sni.is_empty() { None } else { Some(sni.to_string()) },
            port: Some(port),
        };
        let response = self
            .http
            .post(format!("{}/get_target_info", self.base))
            .timeout(TARGET_INFO_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(to_io)?;
        let response = check_status(response, "get_target_info").await?;
        response.json::<TargetInfo>().await.map_err(to_io)
    }

    async fn get_response(&self, session_id: &str) -> io::Result<(Vec<u8>, bool)> {
        let request = serde_json::json!({ "session_id": session_id });
        let response = self
            .http
            .post(format!("{}/get_response", self.base))
            .timeout(CONTROL_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(to_io)?;
        let response = check_status(response, "get_response").await?;
        let payload = response.json::<ResponsePayload>().await.map_err(to_io)?;
        let data = api::decode(&payload.data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok((data, payload.handshake_complete))
    }

    async fn store_client_message(&self, session_id: &str, data: &[u8]) -> io::Result<()> {
        let request = StoreMessageRequest {
            session_id: session_id.to_string(),
            action: ACTION_STORE_CLIENT_MESSAGE.to_string(),
            data: api::encode(data),
        };
        let response = self
            .http
            .post(format!("{}/store_client_message", self.base))
            .timeout(CONTROL_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(to_io)?;
        check_status(response, "store_client_message").await?;
        Ok(())
    }

    async fn signal_handshake_complete(&self, session_id: &str) -> io::Result<()> {
        let request = SessionRequest {
            session_id: session_id.to_string(),
            action: ACTION_COMPLETE_HANDSHAKE.to_string(),
        };
        let response = self
            .http
            .post(format!("{}/complete_handshake", self.base))
            .timeout(CONTROL_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(to_io)?;
        check_status(response, "complete_handshake").await?;
        Ok(())
    }

    async fn release_connection(&self, session_id: &str) {
        let request = SessionRequest {
            session_id: session_id.to_string(),
            action: ACTION_RELEASE_CONNECTION.to_string(),
        };
        let result = self
            .http
            .post(format!("{}/release_connection", self.base))
            .timeout(CONTROL_TIMEOUT)
            .json(&request)
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!("release_connection for {} failed: {}", session_id, e);
        }
    }
}

fn to_io(e: reqwest::Error) -> io::Error {
    if e.is_timeout() {
        io::Error::new(io::ErrorKind::TimedOut, e)
    } else {
        io::Error::other(e)
    }
}

async fn check_status(response: reqwest::Response, what: &str) -> io::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let kind = match status.as_u16() {
        404 => io::ErrorKind::NotFound,
        400 => io::ErrorKind::InvalidInput,
        _ => io::ErrorKind::Other,
    };
    Err(io::Error::new(kind, format!("{}: {} {}", what, status, body)))
}
