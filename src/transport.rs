use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use crate::config::{DispatchConfig, TransportMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The peer is permanently unreachable; its registry rows should go.
    Gone,
    Failed(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, connection_handle: &str, payload: &str) -> DeliveryOutcome;
}

/// WebSocket peers held open by this process, addressed by connection handle.
#[derive(Debug, Clone, Default)]
pub struct LocalTransport {
    peers: Arc<Mutex<HashMap<String, mpsc::Sender<Message>>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, connection_handle: String, tx: mpsc::Sender<Message>) {
        let mut guard = self.peers.lock().await;
        guard.insert(connection_handle, tx);
    }

    pub async fn detach(&self, connection_handle: &str) {
        let mut guard = self.peers.lock().await;
        guard.remove(connection_handle);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, connection_handle: &str, payload: &str) -> DeliveryOutcome {
        let mut guard = self.peers.lock().await;
        let Some(tx) = guard.get(connection_handle) else {
            return DeliveryOutcome::Gone;
        };
        match tx.try_send(Message::Text(payload.to_owned())) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                guard.remove(connection_handle);
                DeliveryOutcome::Gone
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                DeliveryOutcome::Failed("outbound queue full".to_owned())
            }
        }
    }
}

/// Posts each payload to a connection-management endpoint that owns the
/// sockets, at `<base>/@connections/<handle>`.
pub struct CallbackTransport {
    base: Url,
    http: reqwest::Client,
}

impl CallbackTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url.trim())
            .with_context(|| format!("invalid callback url `{base_url}`"))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("callback url `{base_url}` cannot carry a path"));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed building callback http client")?;
        Ok(Self { base, http })
    }

    fn connection_url(&self, connection_handle: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("@connections")
                .push(connection_handle);
        }
        url
    }
}

#[async_trait]
impl Transport for CallbackTransport {
    async fn send(&self, connection_handle: &str, payload: &str) -> DeliveryOutcome {
        let url = self.connection_url(connection_handle);
        let response = match self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.to_owned())
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return DeliveryOutcome::Failed(format!("callback request failed: {err}")),
        };
        let status = response.status();
        if status.is_success() {
            DeliveryOutcome::Delivered
        } else if status == reqwest::StatusCode::GONE {
            debug!("callback reports {connection_handle} gone");
            DeliveryOutcome::Gone
        } else {
            DeliveryOutcome::Failed(format!("callback returned status {}", status.as_u16()))
        }
    }
}

pub fn transport_from_config(
    dispatch: &DispatchConfig,
    local: &LocalTransport,
) -> Result<Arc<dyn Transport>> {
    match dispatch.transport {
        TransportMode::Local => Ok(Arc::new(local.clone())),
        TransportMode::Callback => {
            let base = dispatch.callback_url.as_deref().ok_or_else(|| {
                anyhow!("dispatch.callback_url is required for callback transport")
            })?;
            Ok(Arc::new(CallbackTransport::new(
                base,
                Duration::from_millis(dispatch.delivery_timeout_ms),
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    use super::{CallbackTransport, DeliveryOutcome, LocalTransport, Transport};

    #[tokio::test]
    async fn local_transport_classifies_peers() {
        let hub = LocalTransport::new();
        let (open_tx, mut open_rx) = mpsc::channel(4);
        let (closed_tx, closed_rx) = mpsc::channel(4);
        let (full_tx, _full_rx) = mpsc::channel(1);
        hub.attach("open".to_owned(), open_tx).await;
        hub.attach("closed".to_owned(), closed_tx).await;
        hub.attach("full".to_owned(), full_tx).await;
        drop(closed_rx);

        assert_eq!(hub.send("open", "{}").await, DeliveryOutcome::Delivered);
        assert_eq!(open_rx.recv().await, Some(Message::Text("{}".to_owned())));
        assert_eq!(hub.send("closed", "{}").await, DeliveryOutcome::Gone);
        assert_eq!(hub.send("unknown", "{}").await, DeliveryOutcome::Gone);

        assert_eq!(hub.send("full", "{}").await, DeliveryOutcome::Delivered);
        assert!(matches!(
            hub.send("full", "{}").await,
            DeliveryOutcome::Failed(_)
        ));
        assert_eq!(hub.peer_count().await, 2, "closed peer dropped from hub");
    }

    async fn respond_once(listener: TcpListener, status_line: &'static str) -> String {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut buf = vec![0_u8; 4096];
        let mut request = Vec::new();
        loop {
            let n = stream.read(&mut buf).await.expect("read");
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request);
            if let Some(split) = text.find("\r\n\r\n") {
                let content_length = text[..split]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if request.len() >= split + 4 + content_length {
                    break;
                }
            }
        }
        let response =
            format!("HTTP/1.1 {status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        stream
            .write_all(response.as_bytes())
            .await
            .expect("write");
        String::from_utf8_lossy(&request).into_owned()
    }

    async fn callback_outcome(status_line: &'static str) -> (DeliveryOutcome, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(respond_once(listener, status_line));
        let transport =
            CallbackTransport::new(&format!("http://{addr}/prod/"), Duration::from_secs(3))
                .expect("transport");
        let outcome = transport.send("c-1", r#"{"status":"High"}"#).await;
        let request = server.await.expect("server");
        (outcome, request)
    }

    #[tokio::test]
    async fn callback_posts_to_connection_path() {
        let (outcome, request) = callback_outcome("200 OK").await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert!(
            request.starts_with("POST /prod/@connections/c-1 HTTP/1.1"),
            "unexpected request: {request}"
        );
        assert!(request.ends_with(r#"{"status":"High"}"#));
    }

    #[tokio::test]
    async fn callback_gone_status_maps_to_gone() {
        let (outcome, _) = callback_outcome("410 Gone").await;
        assert_eq!(outcome, DeliveryOutcome::Gone);
    }

    #[tokio::test]
    async fn callback_other_status_is_a_failure() {
        let (outcome, _) = callback_outcome("500 Internal Server Error").await;
        assert_eq!(
            outcome,
            DeliveryOutcome::Failed("callback returned status 500".to_owned())
        );
    }
}
