//! Advisory coordination service for parallel workers.
//!
//! A JSON-over-HTTP server on an ephemeral local port. Workers consult it
//! for file locks, intent announcements, shared decisions, artifacts, and
//! statuses. All state lives behind one reader/writer lock; a background
//! reaper deletes locks whose heartbeat has gone stale.

pub mod state;

use std::io::Read;
use std::sync::mpsc;
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tiny_http::{Header, Response, Server};

pub use state::{AcquireResult, Artifact, CoordState, Decision, FileLock, Intent};

/// Default staleness window after which unrefreshed locks are reaped.
pub const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

pub struct Coordinator {
    state: Arc<RwLock<CoordState>>,
    server: Arc<Server>,
    port: u16,
    accept_handle: Option<JoinHandle<()>>,
    reaper_handle: Option<JoinHandle<()>>,
    reaper_stop: mpsc::Sender<()>,
}

impl Coordinator {
    /// Bind an ephemeral local port and start the accept loop and the lock
    /// reaper.
    pub fn start(stale_after: Duration) -> anyhow::Result<Self> {
        let server = Server::http("127.0.0.1:0")
            .map_err(|e| anyhow::anyhow!("binding coordinator socket: {e}"))?;
        let port = server
            .server_addr()
            .to_ip()
            .map_or(0, |addr| addr.port());
        let server = Arc::new(server);
        let state = Arc::new(RwLock::new(CoordState::default()));

        let accept_state = Arc::clone(&state);
        let accept_server = Arc::clone(&server);
        let accept_handle = std::thread::spawn(move || {
            for request in accept_server.incoming_requests() {
                handle_request(&accept_state, request);
            }
        });

        let (reaper_stop, stop_rx) = mpsc::channel();
        let reaper_state = Arc::clone(&state);
        let tick = (stale_after / 2).clamp(Duration::from_millis(10), Duration::from_secs(30));
        let reaper_handle = std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(tick) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let reaped = write_lock(&reaper_state).reap_stale_locks(stale_after);
                    for path in reaped {
                        tracing::warn!(path, "reaped stale file lock");
                    }
                }
            }
        });

        tracing::info!(port, "coordinator listening");
        Ok(Self {
            state,
            server,
            port,
            accept_handle: Some(accept_handle),
            reaper_handle: Some(reaper_handle),
            reaper_stop,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Shared handle on the coordination state.
    pub fn state(&self) -> Arc<RwLock<CoordState>> {
        Arc::clone(&self.state)
    }

    fn stop(&mut self) {
        let _ = self.reaper_stop.send(());
        self.server.unblock();
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.reaper_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write_lock(state: &RwLock<CoordState>) -> std::sync::RwLockWriteGuard<'_, CoordState> {
    state
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn read_lock(state: &RwLock<CoordState>) -> std::sync::RwLockReadGuard<'_, CoordState> {
    state
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

enum RouteError {
    BadRequest(String),
    Internal(String),
}

fn handle_request(state: &RwLock<CoordState>, mut request: tiny_http::Request) {
    let mut body = String::new();
    if let Err(e) = request.as_reader().read_to_string(&mut body) {
        respond(request, 400, &json!({"error": format!("reading body: {e}")}).to_string());
        return;
    }

    let url = request.url().to_string();
    match route(state, &url, &body) {
        Ok(payload) => respond(request, 200, &payload),
        Err(RouteError::BadRequest(msg)) => {
            respond(request, 400, &json!({"error": msg}).to_string());
        }
        Err(RouteError::Internal(msg)) => {
            respond(request, 500, &json!({"error": msg}).to_string());
        }
    }
}

fn respond(request: tiny_http::Request, code: u16, body: &str) {
    let mut response = Response::from_string(body).with_status_code(code);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        response = response.with_header(header);
    }
    if let Err(e) = request.respond(response) {
        tracing::warn!("coordinator response failed: {e}");
    }
}

fn parse<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, RouteError> {
    let effective = if body.trim().is_empty() { "{}" } else { body };
    serde_json::from_str(effective).map_err(|e| RouteError::BadRequest(e.to_string()))
}

fn encode(value: &serde_json::Value) -> Result<String, RouteError> {
    serde_json::to_string(value).map_err(|e| RouteError::Internal(e.to_string()))
}

#[derive(Deserialize)]
struct LockReq {
    bead_id: String,
    file_path: String,
}

#[derive(Deserialize)]
struct CheckLockReq {
    file_path: String,
}

#[derive(Deserialize)]
struct HeartbeatReq {
    bead_id: String,
}

#[derive(Deserialize)]
struct DecisionReq {
    bead_id: String,
    key: String,
    value: String,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct ReadDecisionsReq {
    #[serde(default)]
    tag: Option<String>,
}

#[derive(Deserialize)]
struct IntentReq {
    bead_id: String,
    action: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Deserialize)]
struct ArtifactReq {
    bead_id: String,
    name: String,
    file_path: String,
    #[serde(default)]
    exports: Vec<String>,
}

#[derive(Deserialize)]
struct QueryArtifactsReq {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct StatusReq {
    bead_id: String,
    status: String,
    #[serde(default)]
    summary: String,
}

fn route(state: &RwLock<CoordState>, url: &str, body: &str) -> Result<String, RouteError> {
    match url {
        "/acquire_lock" => {
            let req: LockReq = parse(body)?;
            let result = write_lock(state).acquire_lock(&req.bead_id, &req.file_path);
            serde_json::to_string(&result).map_err(|e| RouteError::Internal(e.to_string()))
        }
        "/release_lock" => {
            let req: LockReq = parse(body)?;
            let released = write_lock(state).release_lock(&req.bead_id, &req.file_path);
            encode(&json!({"released": released}))
        }
        "/check_lock" => {
            let req: CheckLockReq = parse(body)?;
            let (locked, held_by) = read_lock(state).check_lock(&req.file_path);
            encode(&json!({"locked": locked, "held_by": held_by}))
        }
        "/heartbeat" => {
            let req: HeartbeatReq = parse(body)?;
            write_lock(state).heartbeat(&req.bead_id);
            encode(&json!({"ok": true}))
        }
        "/write_decision" => {
            let req: DecisionReq = parse(body)?;
            write_lock(state).write_decision(
                &req.bead_id,
                &req.key,
                &req.value,
                &req.rationale,
                req.tags,
            );
            encode(&json!({"ok": true}))
        }
        "/read_decisions" => {
            let req: ReadDecisionsReq = parse(body)?;
            let decisions = read_lock(state).read_decisions(req.tag.as_deref());
            serde_json::to_value(decisions)
                .map(|d| json!({"decisions": d}))
                .map_err(|e| RouteError::Internal(e.to_string()))
                .and_then(|v| encode(&v))
        }
        "/announce_intent" => {
            let req: IntentReq = parse(body)?;
            let (conflicts, decisions) = write_lock(state).announce_intent(
                &req.bead_id,
                &req.action,
                &req.description,
                req.files,
            );
            serde_json::to_value(decisions)
                .map(|d| json!({"conflicts": conflicts, "decisions": d}))
                .map_err(|e| RouteError::Internal(e.to_string()))
                .and_then(|v| encode(&v))
        }
        "/publish_artifact" => {
            let req: ArtifactReq = parse(body)?;
            write_lock(state).publish_artifact(
                &req.bead_id,
                &req.name,
                &req.file_path,
                req.exports,
            );
            encode(&json!({"ok": true}))
        }
        "/query_artifacts" => {
            let req: QueryArtifactsReq = parse(body)?;
            let artifacts = read_lock(state).query_artifacts(req.name.as_deref());
            serde_json::to_value(artifacts)
                .map(|a| json!({"artifacts": a}))
                .map_err(|e| RouteError::Internal(e.to_string()))
                .and_then(|v| encode(&v))
        }
        "/report_status" => {
            let req: StatusReq = parse(body)?;
            tracing::debug!(bead = %req.bead_id, status = %req.status, summary = %req.summary, "status report");
            write_lock(state).report_status(&req.bead_id, &req.status);
            encode(&json!({"ok": true}))
        }
        "/get_all_status" => {
            let statuses = read_lock(state).all_statuses();
            encode(&json!({"statuses": statuses}))
        }
        "/health" => encode(&json!({"status": "ok"})),
        other => Err(RouteError::BadRequest(format!("unknown endpoint {other}"))),
    }
}
