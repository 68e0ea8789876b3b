/// HTTP surface of the OOB peer: session-keyed JSON endpoints that broker
/// target handshakes for clients and hand out target metadata.
use crate::upstream;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use shroud_proto::api::{
    self, ErrorResponse, ResponsePayload, ResponseRequest, SessionRequest, StoreMessageRequest,
    TargetInfo, TargetInfoRequest,
};
use shroud_proto::session::{Session, SessionRegistry, REMOVAL_GRACE};
use shroud_proto::tls;
use std::io;
use std::sync::Arc;
use tokio::time::sleep;

pub struct OobState {
    pub registry: Arc<SessionRegistry>,
}

pub fn router(state: Arc<OobState>) -> Router {
    Router::new()
        .route("/get_target_info", post(get_target_info))
        .route("/get_response", post(get_response))
        .route("/store_client_message", post(store_client_message))
        .route("/complete_handshake", post(complete_handshake))
        .route("/release_connection", post(release_connection))
        .with_state(state)
}

// ── /get_target_info ─────────────────────────────────────────────────

/// Three request shapes share this endpoint:
/// - a ClientHello initiates a brokered handshake and answers immediately
///   with the resolved target;
/// - a bare SNI resolves the target without brokering anything;
/// - neither queries an existing session, gated on handshake completion.
async fn get_target_info(
    State(state): State<Arc<OobState>>,
    Json(req): Json<TargetInfoRequest>,
) -> Response {
    let port = req.port.unwrap_or(443);

    if let Some(encoded) = req.client_hello.as_deref() {
        let hello = match api::decode(encoded) {
            Ok(hello) => hello,
            Err(e) => return bad_request(format!("undecodable client_hello: {}", e)),
        };
        let sni = match tls::extract_sni(&hello) {
            Ok(sni) => sni,
            Err(e) => match req.sni.clone() {
                Some(sni) => sni,
                None => return bad_request(format!("unusable ClientHello: {}", e)),
            },
        };
        let session = match state.registry.create(&req.session_id, &sni) {
            Ok(session) => session,
            Err(e) => return bad_request(format!("cannot create session: {}", e)),
        };
        tracing::info!("session {}: brokering handshake for {}:{}", req.session_id, sni, port);
        match broker_target(&session, &hello, &sni, port).await {
            Ok(info) => (StatusCode::OK, Json(info)).into_response(),
            Err(e) => {
                tracing::warn!("session {}: target {}:{} unreachable: {}", req.session_id, sni, port, e);
                state.registry.remove(&req.session_id).await;
                bad_gateway(format!("target unreachable: {}", e))
            }
        }
    } else if let Some(sni) = req.sni.as_deref() {
        let session = match state.registry.get(&req.session_id) {
            Some(session) => session,
            None => match state.registry.create(&req.session_id, sni) {
                Ok(session) => session,
                Err(e) => return bad_request(format!("cannot create session: {}", e)),
            },
        };
        let addr = match upstream::resolve_target(sni, port).await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("session {}: cannot resolve {}: {}", req.session_id, sni, e);
                state.registry.remove(&req.session_id).await;
                return bad_gateway(format!("cannot resolve {}: {}", sni, e));
            }
        };
        session.set_target_addr(&addr.ip().to_string(), addr.port());
        // Nothing is brokered for this session, so there is no handshake
        // whose completion could gate later queries.
        session.mark_handshake_complete();
        tracing::info!("session {}: resolved {} to {}", req.session_id, sni, addr);
        (StatusCode::OK, Json(target_info_of(&session))).into_response()
    } else {
        match state.registry.get(&req.session_id) {
            None => not_found("no such session"),
            Some(session) if !session.handshake_complete() => {
                bad_request("handshake not complete".to_string())
            }
            Some(session) => (StatusCode::OK, Json(target_info_of(&session))).into_response(),
        }
    }
}

/// Dial the target, send the ClientHello, park the write half in the
/// session and start the response pump.
async fn broker_target(
    session: &Arc<Session>,
    hello: &[u8],
    sni: &str,
    port: u16,
) -> io::Result<TargetInfo> {
    let addr = upstream::resolve_target(sni, port).await?;
    let target = upstream::open_target(addr).await?;

    if let Ok(header) = tls::parse_record_header(hello) {
        session.set_tls_version(header.version);
    }
    session.set_target_addr(&addr.ip().to_string(), addr.port());
    session.store_client_message(hello.to_vec());

    let (read_half, write_half) = target.into_split();
    session.set_target_writer(write_half).await;
    session.write_to_target(hello).await?;
    upstream::spawn_response_pump(session.clone(), read_half);

    Ok(target_info_of(session))
}

fn target_info_of(session: &Arc<Session>) -> TargetInfo {
    let sni = session.sni();
    let (target_ip, target_port) = session
        .target_addr()
        .unwrap_or_else(|| (sni.clone(), 443));
    TargetInfo {
        target_host: sni.clone(),
        target_ip,
        target_port,
        sni,
        session_ticket: session.session_ticket().map(|t| api::encode(&t)),
        master_secret: None,
        tls_version: session.tls_version().unwrap_or(0x0303),
        alpn: None,
    }
}

// ── /get_response ────────────────────────────────────────────────────

async fn get_response(
    State(state): State<Arc<OobState>>,
    Json(req): Json<ResponseRequest>,
) -> Response {
    let session = match state.registry.get(&req.session_id) {
        Some(session) => session,
        None => return not_found("no such session"),
    };
    let (data, handshake_complete) = match req.index {
        Some(index) => session.peek_response(index as usize),
        None => session.get_response(),
    };
    let payload = ResponsePayload {
        data: data.map(|d| api::encode(&d)).unwrap_or_default(),
        handshake_complete,
    };
    (StatusCode::OK, Json(payload)).into_response()
}

// ── /store_client_message ────────────────────────────────────────────

async fn store_client_message(
    State(state): State<Arc<OobState>>,
    Json(req): Json<StoreMessageRequest>,
) -> Response {
    let session = match state.registry.get(&req.session_id) {
        Some(session) => session,
        None => return not_found("no such session"),
    };
    let data = match api::decode(&req.data) {
        Ok(data) => data,
        Err(e) => return bad_request(format!("undecodable data: {}", e)),
    };
    session.store_client_message(data.clone());
    match session.write_to_target(&data).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            tracing::warn!("session {}: target write failed: {}", req.session_id, e);
            bad_gateway(format!("target write failed: {}", e))
        }
    }
}

// ── /complete_handshake ──────────────────────────────────────────────

async fn complete_handshake(
    State(state): State<Arc<OobState>>,
    Json(req): Json<SessionRequest>,
) -> Response {
    let session = match state.registry.get(&req.session_id) {
        Some(session) => session,
        None => return not_found("no such session"),
    };
    session.mark_handshake_complete();

    // Short grace so in-flight get_response callers observe the final
    // state before the session disappears.
    let registry = state.registry.clone();
    let session_id = req.session_id.clone();
    tokio::spawn(async move {
        sleep(REMOVAL_GRACE).await;
        registry.remove(&session_id).await;
    });

    StatusCode::OK.into_response()
}

// ── /release_connection ──────────────────────────────────────────────

async fn release_connection(
    State(state): State<Arc<OobState>>,
    Json(req): Json<SessionRequest>,
) -> Response {
    if state.registry.remove(&req.session_id).await {
        tracing::debug!("session {} released", req.session_id);
    }
    StatusCode::OK.into_response()
}

// ── Helpers ──────────────────────────────────────────────────────────

fn not_found(error: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error: error.to_string() })).into_response()
}

fn bad_request(error: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error })).into_response()
}

fn bad_gateway(error: String) -> Response {
    (StatusCode::BAD_GATEWAY, Json(ErrorResponse { error })).into_response()
}
