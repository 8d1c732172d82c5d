use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::actions::ActionRequest;
use crate::config::ServerConfig;
use crate::error::{ActionError, LifecycleError};
use crate::lifecycle::{ConnectRequest, DisconnectRequest};
use crate::runtime::Services;
use crate::security::extract_bearer;

const CONTROL_HTTP_MAX_REQUEST_BYTES: usize = 256 * 1024;
const CONTROL_HTTP_READ_CHUNK_BYTES: usize = 4096;
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_INTERNAL_ERROR: u16 = 1011;

pub struct GatewayServer {
    settings: ServerConfig,
    services: Arc<Services>,
}

struct ServerState {
    settings: ServerConfig,
    services: Arc<Services>,
    conn_seq: AtomicU64,
}

impl ServerState {
    fn next_connection_handle(&self) -> String {
        let seq = self.conn_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("conn-{}-{seq}", now_ms())
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ConnectParamsPayload {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default)]
    subject_id: Option<String>,
}

type PeerSink = SplitSink<WebSocketStream<TcpStream>, Message>;

impl GatewayServer {
    pub fn new(settings: ServerConfig, services: Arc<Services>) -> Self {
        Self { settings, services }
    }

    pub async fn run_forever(&self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.settings.bind)
            .await
            .with_context(|| {
                format!(
                    "failed binding websocket listener on {}",
                    self.settings.bind
                )
            })?;
        let bound_addr = listener
            .local_addr()
            .context("failed reading bound address")?;
        info!("realtime gateway listening on ws://{bound_addr}");

        let state = Arc::new(ServerState {
            settings: self.settings.clone(),
            services: self.services.clone(),
            conn_seq: AtomicU64::new(0),
        });
        let http_task = self.spawn_control_http_task(state.clone());

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let state = state.clone();
                            tokio::spawn(async move {
                                if let Err(err) =
                                    handle_connection(stream, remote_addr, state).await
                                {
                                    warn!("realtime connection {remote_addr} failed: {err:#}");
                                }
                            });
                        }
                        Err(err) => {
                            warn!("realtime gateway accept failed: {err}");
                        }
                    }
                }
            }
        }

        if let Some(task) = http_task {
            task.abort();
            let _ = task.await;
        }
        Ok(())
    }

    fn spawn_control_http_task(
        &self,
        state: Arc<ServerState>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let bind = self.settings.http_bind.clone()?;
        if bind.trim().is_empty() {
            return None;
        }
        Some(tokio::spawn(async move {
            let listener = match TcpListener::bind(&bind).await {
                Ok(listener) => listener,
                Err(err) => {
                    warn!("control-http bind failed on {bind}: {err}");
                    return;
                }
            };
            let bound = listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or(bind.clone());
            info!("control-http listening on http://{bound}");
            loop {
                match listener.accept().await {
                    Ok((stream, remote_addr)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_control_http_connection(stream, state).await {
                                warn!("control-http connection {remote_addr} failed: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        warn!("control-http accept failed: {err}");
                    }
                }
            }
        }))
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: std::net::SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    let ws = accept_async(stream)
        .await
        .with_context(|| format!("websocket upgrade failed for {remote_addr}"))?;
    let conn_id = state.next_connection_handle();
    let (mut write, mut read) = ws.split();

    let inbound = timeout(
        Duration::from_millis(state.settings.handshake_timeout_ms),
        read.next(),
    )
    .await
    .context("connect handshake timed out")?
    .ok_or_else(|| anyhow::anyhow!("connection closed before connect handshake"))?
    .context("failed receiving connect handshake frame")?;
    let handshake_text = inbound
        .to_text()
        .context("connect handshake frame must be text")?;
    let frame: Value = serde_json::from_str(handshake_text).context("invalid connect JSON frame")?;
    let req_id = frame
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("connect")
        .to_owned();
    let is_connect = frame.get("type").and_then(Value::as_str) == Some("req")
        && frame
            .get("method")
            .and_then(Value::as_str)
            .map(normalize_method)
            .as_deref()
            == Some("connect");
    if !is_connect {
        reject_handshake(
            &mut write,
            &req_id,
            400,
            "invalid handshake: first request must be connect",
            CLOSE_POLICY_VIOLATION,
        )
        .await?;
        return Ok(());
    }
    let params: ConnectParamsPayload =
        match serde_json::from_value(frame.get("params").cloned().unwrap_or_else(|| json!({}))) {
            Ok(params) => params,
            Err(err) => {
                debug!("invalid connect params from {remote_addr}: {err}");
                reject_handshake(
                    &mut write,
                    &req_id,
                    400,
                    "invalid connect params",
                    CLOSE_POLICY_VIOLATION,
                )
                .await?;
                return Ok(());
            }
        };

    let capacity = state.settings.outbound_queue_capacity.max(8);
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(capacity);
    let services = &state.services;
    services.local.attach(conn_id.clone(), out_tx.clone()).await;
    let grant = match services
        .lifecycle
        .connect(ConnectRequest {
            connection_handle: conn_id.clone(),
            channels: params.channels,
            subject_id: params.subject_id,
            token: params.token,
        })
        .await
    {
        Ok(grant) => grant,
        Err(err) => {
            services.local.detach(&conn_id).await;
            let (code, reason, close) = match &err {
                LifecycleError::Rejected(_) => (401, "unauthorized", CLOSE_POLICY_VIOLATION),
                LifecycleError::Registry(_) => {
                    (503, "registry unavailable", CLOSE_INTERNAL_ERROR)
                }
            };
            warn!("realtime connect from {remote_addr} refused: {err}");
            reject_handshake(&mut write, &req_id, code, reason, close).await?;
            return Ok(());
        }
    };

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
    });

    let hello = json!({
        "type": "hello-ok",
        "protocol": 1,
        "server": {
            "version": env!("CARGO_PKG_VERSION"),
            "runtime": "staffing-realtime",
            "connId": conn_id,
            "host": remote_addr.ip().to_string(),
        },
        "subject": grant.authorized_subject(),
        "channels": grant.channels(),
        "subjectId": grant.subject_id(),
        "policy": {
            "outboundQueue": capacity,
        }
    });
    let _ = out_tx
        .send(Message::Text(response_ok(&req_id, hello).to_string()))
        .await;
    info!(
        "realtime connected conn_id={} subject={} channels={}",
        conn_id,
        grant.authorized_subject(),
        grant.channels().join(",")
    );

    let outcome = async {
        while let Some(inbound) = read.next().await {
            match inbound.context("websocket inbound error")? {
                Message::Text(text) => handle_peer_frame(&conn_id, &text, &out_tx).await,
                Message::Ping(payload) => {
                    let _ = out_tx.try_send(Message::Pong(payload));
                }
                Message::Close(_) => break,
                Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    services.local.detach(&conn_id).await;
    if let Err(err) = services.lifecycle.release(grant).await {
        warn!("realtime release of {conn_id} failed: {err}");
    }
    drop(out_tx);
    let _ = writer.await;
    info!("realtime disconnected conn_id={conn_id}");
    outcome
}

async fn handle_peer_frame(conn_id: &str, text: &str, out_tx: &mpsc::Sender<Message>) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("invalid JSON frame on {conn_id}: {err}");
            return;
        }
    };
    if frame.get("type").and_then(Value::as_str) != Some("req") {
        return;
    }
    let id = frame.get("id").and_then(Value::as_str).unwrap_or_default();
    let method = frame
        .get("method")
        .and_then(Value::as_str)
        .map(normalize_method)
        .unwrap_or_default();
    let response = match method.as_str() {
        "ping" => response_ok(id, json!({ "at": now_ms() })),
        _ => response_error(id, 404, &format!("unknown method: {method}")),
    };
    let _ = out_tx.send(Message::Text(response.to_string())).await;
}

async fn reject_handshake(
    write: &mut PeerSink,
    req_id: &str,
    code: u16,
    reason: &'static str,
    close: u16,
) -> Result<()> {
    write
        .send(Message::Text(response_error(req_id, code, reason).to_string()))
        .await?;
    write
        .send(Message::Close(Some(close_frame(close, reason))))
        .await?;
    Ok(())
}

fn response_ok(id: &str, result: Value) -> Value {
    json!({
        "type": "res",
        "id": id,
        "ok": true,
        "result": result,
    })
}

fn response_error(id: &str, code: u16, message: &str) -> Value {
    json!({
        "type": "res",
        "id": id,
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

struct ControlHttpRequest {
    method: String,
    path: String,
    authorization: Option<String>,
    body: Vec<u8>,
}

impl ControlHttpRequest {
    fn bearer_token(&self) -> Option<String> {
        self.authorization
            .as_deref()
            .and_then(extract_bearer)
            .map(ToOwned::to_owned)
    }
}

async fn handle_control_http_connection(
    mut stream: TcpStream,
    state: Arc<ServerState>,
) -> Result<()> {
    let Some(request) = read_control_http_request(&mut stream).await? else {
        return Ok(());
    };

    if request.method == "POST" {
        if let Some(name) = request.path.strip_prefix("/actions/") {
            let name = name.trim_matches('/').to_owned();
            return handle_action_http(&mut stream, &state, &name, &request).await;
        }
        if let Some(name) = request.path.strip_prefix("/authorize/") {
            let name = name.trim_matches('/').to_owned();
            return handle_authorize_http(&mut stream, &state, &name, &request).await;
        }
    }

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => {
            let payload = json!({
                "ok": true,
                "result": {
                    "runtime": "staffing-realtime",
                    "version": env!("CARGO_PKG_VERSION"),
                    "localPeers": state.services.local.peer_count().await,
                    "actions": state.services.actions.action_names(),
                }
            });
            write_http_json_response(&mut stream, 200, &payload).await
        }
        ("POST", "/connections/connect") => {
            handle_connect_http(&mut stream, &state, &request).await
        }
        ("POST", "/connections/disconnect") => {
            handle_disconnect_http(&mut stream, &state, &request).await
        }
        (_, "/health" | "/connections/connect" | "/connections/disconnect") => {
            write_http_json_response(&mut stream, 405, &error_payload(405, "method not allowed"))
                .await
        }
        _ => write_http_json_response(&mut stream, 404, &error_payload(404, "not found")).await,
    }
}

async fn handle_action_http(
    stream: &mut TcpStream,
    state: &ServerState,
    name: &str,
    request: &ControlHttpRequest,
) -> Result<()> {
    let mut action = if request.body.is_empty() {
        ActionRequest::default()
    } else {
        match serde_json::from_slice::<ActionRequest>(&request.body) {
            Ok(action) => action,
            Err(err) => {
                let message = format!("invalid action body: {err}");
                return write_http_json_response(stream, 400, &error_payload(400, &message)).await;
            }
        }
    };
    if let Some(token) = request.bearer_token() {
        action.token = Some(token);
    }

    match state.services.actions.execute(name, action).await {
        Ok(outcome) => {
            write_http_json_response(stream, 200, &json!({ "ok": true, "result": outcome })).await
        }
        Err(err) => {
            let (status, payload) = action_error_payload(&err);
            write_http_json_response(stream, status, &payload).await
        }
    }
}

/// Authorizer-style query: always 200, the decision carries allow/deny.
async fn handle_authorize_http(
    stream: &mut TcpStream,
    state: &ServerState,
    name: &str,
    request: &ControlHttpRequest,
) -> Result<()> {
    let query = if request.body.is_empty() {
        ActionRequest::default()
    } else {
        match serde_json::from_slice::<ActionRequest>(&request.body) {
            Ok(query) => query,
            Err(err) => {
                let message = format!("invalid authorize body: {err}");
                return write_http_json_response(stream, 400, &error_payload(400, &message)).await;
            }
        }
    };
    let token = request.bearer_token().or(query.token);
    let decision = state
        .services
        .actions
        .decide(name, token.as_deref(), &query.path_parameters)
        .await;
    write_http_json_response(stream, 200, &json!({ "ok": true, "result": decision })).await
}

fn action_error_payload(err: &ActionError) -> (u16, Value) {
    match err {
        ActionError::Rejected(_) => (401, unauthorized_payload()),
        ActionError::UnknownAction(_) => (404, error_payload(404, &err.to_string())),
        ActionError::Apply(_) => (500, error_payload(500, &err.to_string())),
        ActionError::NotificationFailed { .. } => (
            502,
            json!({
                "ok": false,
                "committed": err.write_committed(),
                "error": {
                    "code": 502,
                    "message": err.to_string(),
                }
            }),
        ),
    }
}

async fn handle_connect_http(
    stream: &mut TcpStream,
    state: &ServerState,
    request: &ControlHttpRequest,
) -> Result<()> {
    let mut connect = match serde_json::from_slice::<ConnectRequest>(&request.body) {
        Ok(connect) => connect,
        Err(err) => {
            let message = format!("invalid connect body: {err}");
            return write_http_json_response(stream, 400, &error_payload(400, &message)).await;
        }
    };
    if let Some(token) = request.bearer_token() {
        connect.token = Some(token);
    }
    match state.services.lifecycle.connect(connect).await {
        Ok(grant) => {
            let payload = json!({
                "ok": true,
                "result": {
                    "connectionHandle": grant.connection_handle(),
                    "channels": grant.channels(),
                    "subjectId": grant.subject_id(),
                }
            });
            write_http_json_response(stream, 200, &payload).await
        }
        Err(err) => {
            let (status, payload) = lifecycle_error_payload(&err);
            write_http_json_response(stream, status, &payload).await
        }
    }
}

async fn handle_disconnect_http(
    stream: &mut TcpStream,
    state: &ServerState,
    request: &ControlHttpRequest,
) -> Result<()> {
    let mut disconnect = match serde_json::from_slice::<DisconnectRequest>(&request.body) {
        Ok(disconnect) => disconnect,
        Err(err) => {
            let message = format!("invalid disconnect body: {err}");
            return write_http_json_response(stream, 400, &error_payload(400, &message)).await;
        }
    };
    if let Some(token) = request.bearer_token() {
        disconnect.token = Some(token);
    }
    let handle = disconnect.connection_handle.clone();
    match state.services.lifecycle.disconnect(disconnect).await {
        Ok(()) => {
            let payload = json!({ "ok": true, "result": { "connectionHandle": handle } });
            write_http_json_response(stream, 200, &payload).await
        }
        Err(err) => {
            let (status, payload) = lifecycle_error_payload(&err);
            write_http_json_response(stream, status, &payload).await
        }
    }
}

fn lifecycle_error_payload(err: &LifecycleError) -> (u16, Value) {
    match err {
        LifecycleError::Rejected(_) => (401, unauthorized_payload()),
        LifecycleError::Registry(_) => (503, error_payload(503, &err.to_string())),
    }
}

/// Every denial looks the same from outside.
fn unauthorized_payload() -> Value {
    error_payload(401, "unauthorized")
}

fn error_payload(code: u16, message: &str) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn find_http_header_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(idx) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
        return Some((idx, 4));
    }
    buf.windows(2)
        .position(|window| window == b"\n\n")
        .map(|idx| (idx, 2))
}

fn parse_http_header<'a>(headers: &'a str, wanted: &str) -> Option<&'a str> {
    headers.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case(wanted)
            .then(|| value.trim())
    })
}

fn parse_http_content_length(headers: &str) -> Option<usize> {
    parse_http_header(headers, "content-length").and_then(|value| value.parse::<usize>().ok())
}

async fn read_control_http_request(stream: &mut TcpStream) -> Result<Option<ControlHttpRequest>> {
    let mut buffer = Vec::with_capacity(8 * 1024);
    let mut chunk = vec![0_u8; CONTROL_HTTP_READ_CHUNK_BYTES];
    let mut header_info: Option<(usize, usize, usize)> = None;

    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .context("failed reading control-http request bytes")?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > CONTROL_HTTP_MAX_REQUEST_BYTES {
            anyhow::bail!("control-http request exceeds max size");
        }

        if header_info.is_none() {
            if let Some((header_end, separator_len)) = find_http_header_terminator(&buffer) {
                let headers = String::from_utf8_lossy(&buffer[..header_end]);
                let content_length = parse_http_content_length(&headers).unwrap_or(0);
                header_info = Some((header_end, separator_len, content_length));
            }
        }

        if let Some((header_end, separator_len, content_length)) = header_info {
            if buffer.len() >= header_end + separator_len + content_length {
                break;
            }
        }
    }

    if buffer.is_empty() {
        return Ok(None);
    }

    let (header_end, separator_len) = find_http_header_terminator(&buffer).ok_or_else(|| {
        anyhow::anyhow!("invalid control-http request: missing header terminator")
    })?;
    let headers = String::from_utf8_lossy(&buffer[..header_end]);
    let request_line = headers.lines().next().unwrap_or_default();
    let mut segments = request_line.split_whitespace();
    let method = segments
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_uppercase();
    let path_raw = segments.next().unwrap_or("/").trim();
    if method.is_empty() {
        anyhow::bail!("invalid control-http request line");
    }
    let path = path_raw
        .split('?')
        .next()
        .unwrap_or(path_raw)
        .trim()
        .to_owned();
    let authorization = parse_http_header(&headers, "authorization").map(ToOwned::to_owned);
    let content_length = parse_http_content_length(&headers).unwrap_or(0);
    let body_start = header_end + separator_len;
    if buffer.len() < body_start + content_length {
        anyhow::bail!("truncated control-http request body");
    }
    let body = buffer[body_start..body_start + content_length].to_vec();
    Ok(Some(ControlHttpRequest {
        method,
        path,
        authorization,
        body,
    }))
}

async fn write_http_json_response(
    stream: &mut TcpStream,
    status_code: u16,
    payload: &Value,
) -> Result<()> {
    let body = serde_json::to_vec(payload).context("failed serializing control-http JSON body")?;
    let status_text = match status_code {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "OK",
    };
    let head = format!(
        "HTTP/1.1 {status_code} {status_text}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\nCache-Control: no-store\r\n\r\n",
        body.len()
    );
    stream
        .write_all(head.as_bytes())
        .await
        .context("failed writing control-http headers")?;
    stream
        .write_all(&body)
        .await
        .context("failed writing control-http body")?;
    let _ = stream.shutdown().await;
    Ok(())
}

fn normalize_method(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

fn close_frame(code: u16, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
