//! Resilient protocol client over `tokio-tungstenite`.
//!
//! One socket per client. Commands get a fresh id, are parked in the pending
//! map, and are resolved by the reader task when the matching response
//! arrives. Messages with a `method` and no `id` are republished as
//! [`ClientEvent::Protocol`]. An unexpected close fails in-flight commands
//! and schedules reconnects with exponential backoff until the attempt
//! ceiling is reached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::backoff::reconnect_delay;
use crate::discovery::{Discovery, select_target};
use crate::error::CdpError;
use crate::types::{ClientConfig, ClientEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A command waiting for its response.
struct PendingCommand {
    method: String,
    sent_at: Instant,
    tx: oneshot::Sender<Result<Value, CdpError>>,
}

/// The live socket: a writer queue plus the tasks driving it.
struct Link {
    generation: u64,
    writer: mpsc::UnboundedSender<Message>,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

#[derive(Default)]
struct ConnectionState {
    reconnect_attempts: u32,
    intentionally_closed: bool,
    generation: u64,
    fatal_reported: bool,
    link: Option<Link>,
    reconnect_task: Option<JoinHandle<()>>,
}

struct Inner {
    config: ClientConfig,
    discovery: Discovery,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCommand>>,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// Client for the remote debugging protocol.
///
/// Cheap to clone; clones share the socket, pending map, and event stream.
#[derive(Clone)]
pub struct ProtocolClient {
    inner: Arc<Inner>,
}

impl ProtocolClient {
    /// Client that discovers targets at `config.host:config.port`.
    pub fn new(config: ClientConfig) -> Self {
        let discovery = Discovery::new(&config.host, config.port);
        Self::with_discovery(config, discovery)
    }

    /// Client using an explicit discovery client.
    pub fn with_discovery(config: ClientConfig, discovery: Discovery) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                discovery,
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                state: Mutex::new(ConnectionState::default()),
                events,
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Discovery client for target management.
    pub fn discovery(&self) -> &Discovery {
        &self.inner.discovery
    }

    /// Connection parameters.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Subscribe to lifecycle and protocol events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Whether a socket is currently open.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().link.is_some()
    }

    /// Consecutive reconnect attempts since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().reconnect_attempts
    }

    /// Number of commands awaiting a response.
    pub fn pending_commands(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Discover a target and open the socket. No-op when already connected.
    ///
    /// Clears a previous [`disconnect`](Self::disconnect) and cancels any
    /// scheduled reconnect.
    pub async fn connect(&self) -> Result<(), CdpError> {
        {
            let mut state = self.inner.state.lock();
            state.intentionally_closed = false;
            if let Some(task) = state.reconnect_task.take() {
                task.abort();
            }
        }
        Inner::establish(&self.inner).await
    }

    /// Send a command with the configured default timeout.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        self.send_command_with_timeout(method, params, self.inner.config.command_timeout)
            .await
    }

    /// Send a command and wait up to `timeout` for its result.
    pub async fn send_command_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CdpError> {
        let writer = self
            .inner
            .state
            .lock()
            .link
            .as_ref()
            .map(|link| link.writer.clone())
            .ok_or(CdpError::NotConnected)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let _ = self.inner.pending.lock().insert(
            id,
            PendingCommand {
                method: method.to_string(),
                sent_at: Instant::now(),
                tx,
            },
        );

        let frame = json!({ "id": id, "method": method, "params": params });
        if writer.send(Message::Text(frame.to_string().into())).is_err() {
            let _ = self.inner.pending.lock().remove(&id);
            return Err(CdpError::ConnectionClosed);
        }
        counter!("cdp_commands_total").increment(1);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CdpError::ConnectionClosed),
            Err(_) => {
                let _ = self.inner.pending.lock().remove(&id);
                counter!("cdp_command_timeouts_total").increment(1);
                warn!(id, method, "command timed out");
                Err(CdpError::CommandTimeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Close the socket and stop reconnecting. In-flight commands fail with
    /// [`CdpError::Disconnected`].
    pub async fn disconnect(&self) {
        let link = {
            let mut state = self.inner.state.lock();
            state.intentionally_closed = true;
            if let Some(task) = state.reconnect_task.take() {
                task.abort();
            }
            state.link.take()
        };
        self.inner.fail_pending(|| CdpError::Disconnected);

        if let Some(link) = link {
            link.reader_task.abort();
            let _ = link.writer.send(Message::Close(None));
            drop(link.writer);
            let _ = tokio::time::timeout(Duration::from_secs(1), link.writer_task).await;
            gauge!("cdp_connected").set(0.0);
            info!("protocol client disconnected");
            self.inner.emit(ClientEvent::Disconnected);
        }
    }

    /// Wait for the next protocol event named `method`.
    pub async fn wait_for_event(&self, method: &str, timeout: Duration) -> Result<Value, CdpError> {
        let mut rx = self.subscribe();
        next_event(&mut rx, method, timeout).await
    }

    /// Navigate the attached page and wait for its load event.
    pub async fn navigate(&self, url: &str) -> Result<(), CdpError> {
        let mut rx = self.subscribe();
        let _ = self.send_command("Page.enable", json!({})).await?;
        let result = self
            .send_command("Page.navigate", json!({ "url": url }))
            .await?;
        if let Some(reason) = result.get("errorText").and_then(Value::as_str) {
            return Err(CdpError::Navigation {
                url: url.to_string(),
                reason: reason.to_string(),
            });
        }
        let _ = next_event(&mut rx, "Page.loadEventFired", self.inner.config.command_timeout).await?;
        Ok(())
    }

    /// Evaluate a JavaScript expression and return its value.
    pub async fn evaluate(&self, expression: &str) -> Result<Value, CdpError> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let message = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("unknown exception");
            return Err(CdpError::Evaluation {
                message: message.to_string(),
            });
        }
        Ok(result["result"]["value"].clone())
    }

    /// Capture the viewport as a base64-encoded PNG.
    pub async fn screenshot(&self) -> Result<String, CdpError> {
        let result = self
            .send_command("Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        result["data"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CdpError::Protocol {
                method: "Page.captureScreenshot".into(),
                message: "response has no data".into(),
            })
    }
}

async fn next_event(
    rx: &mut broadcast::Receiver<ClientEvent>,
    method: &str,
    timeout: Duration,
) -> Result<Value, CdpError> {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(ClientEvent::Protocol { method: m, params }) if m == method => return Ok(params),
                Ok(ClientEvent::Disconnected) => return Err(CdpError::ConnectionClosed),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(CdpError::ConnectionClosed),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| CdpError::EventTimeout {
            method: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })?
}

impl Inner {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn fail_pending(&self, err: impl Fn() -> CdpError) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (id, cmd) in drained {
            debug!(id, method = %cmd.method, "failing in-flight command");
            let _ = cmd.tx.send(Err(err()));
        }
    }

    async fn establish(inner: &Arc<Self>) -> Result<(), CdpError> {
        let _guard = inner.connect_lock.lock().await;
        if inner.state.lock().link.is_some() {
            return Ok(());
        }

        let targets = inner.discovery.list_targets().await?;
        let target = select_target(&targets).ok_or_else(|| CdpError::NoTargets {
            endpoint: inner.discovery.list_url(),
        })?;
        let url = target.web_socket_debugger_url.clone().unwrap_or_default();

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| CdpError::Connect {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        let (mut sink, mut stream) = ws.split();

        let mut state = inner.state.lock();
        if state.intentionally_closed {
            return Err(CdpError::Disconnected);
        }
        state.generation += 1;
        let generation = state.generation;

        let (writer, mut outbound) = mpsc::unbounded_channel::<Message>();
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let weak = Arc::downgrade(inner);
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let Some(inner) = weak.upgrade() else { return };
                match frame {
                    Ok(Message::Text(text)) => inner.dispatch(&text),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            if let Some(inner) = weak.upgrade() {
                Inner::handle_close(&inner, generation);
            }
        });

        state.link = Some(Link {
            generation,
            writer,
            writer_task,
            reader_task,
        });
        state.reconnect_attempts = 0;
        state.fatal_reported = false;
        drop(state);

        gauge!("cdp_connected").set(1.0);
        info!(%url, target = %target.id, "protocol client connected");
        inner.emit(ClientEvent::Connected { url });
        Ok(())
    }

    fn dispatch(&self, text: &str) {
        let Ok(val) = serde_json::from_str::<Value>(text) else {
            debug!("ignoring unparseable frame");
            return;
        };

        if let Some(id) = val.get("id").and_then(Value::as_u64) {
            let Some(cmd) = self.pending.lock().remove(&id) else {
                debug!(id, "response for unknown command id");
                return;
            };
            let outcome = match val.get("error") {
                Some(err) => Err(CdpError::Protocol {
                    method: cmd.method.clone(),
                    message: err["message"].as_str().unwrap_or("unknown error").to_string(),
                }),
                None => Ok(val.get("result").cloned().unwrap_or(Value::Null)),
            };
            debug!(
                id,
                method = %cmd.method,
                elapsed_ms = cmd.sent_at.elapsed().as_millis() as u64,
                ok = outcome.is_ok(),
                "command resolved"
            );
            let _ = cmd.tx.send(outcome);
        } else if let Some(method) = val.get("method").and_then(Value::as_str) {
            self.emit(ClientEvent::Protocol {
                method: method.to_string(),
                params: val.get("params").cloned().unwrap_or(Value::Null),
            });
        }
    }

    fn handle_close(inner: &Arc<Self>, generation: u64) {
        let reconnect = {
            let mut state = inner.state.lock();
            match &state.link {
                Some(link) if link.generation == generation => {}
                _ => return,
            }
            state.link = None;
            !state.intentionally_closed
        };

        gauge!("cdp_connected").set(0.0);
        warn!(generation, "protocol socket closed unexpectedly");
        inner.fail_pending(|| CdpError::ConnectionClosed);
        inner.emit(ClientEvent::Disconnected);
        if reconnect {
            Inner::schedule_reconnect(inner);
        }
    }

    fn schedule_reconnect(inner: &Arc<Self>) {
        let max = inner.config.max_reconnect_attempts;
        let mut state = inner.state.lock();
        if state.intentionally_closed {
            return;
        }

        if state.reconnect_attempts >= max {
            if state.fatal_reported {
                return;
            }
            state.fatal_reported = true;
            let attempts = state.reconnect_attempts;
            drop(state);
            error!(attempts, "reconnect attempts exhausted");
            inner.emit(ClientEvent::Fatal { attempts });
            return;
        }

        state.reconnect_attempts += 1;
        let attempt = state.reconnect_attempts;
        let delay = reconnect_delay(attempt, inner.config.base_delay, inner.config.max_delay);
        let weak: Weak<Self> = Arc::downgrade(inner);
        state.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            if let Err(err) = Inner::establish(&inner).await {
                warn!(attempt, error = %err, "reconnect failed");
                inner.emit(ClientEvent::Error {
                    message: err.to_string(),
                });
                Inner::schedule_reconnect(&inner);
            }
        }));
        drop(state);

        counter!("cdp_reconnects_total").increment(1);
        info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        inner.emit(ClientEvent::Reconnecting { attempt, delay });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ProtocolClient {
        ProtocolClient::with_discovery(
            ClientConfig::default(),
            Discovery::with_base_url("http://127.0.0.1:1"),
        )
    }

    #[tokio::test]
    async fn send_without_connection_is_not_connected() {
        let client = client();
        let err = client.send_command("Browser.getVersion", json!({})).await.unwrap_err();
        assert!(matches!(err, CdpError::NotConnected));
        assert_eq!(client.pending_commands(), 0);
    }

    #[tokio::test]
    async fn dispatch_resolves_matching_pending() {
        let client = client();
        let (tx, rx) = oneshot::channel();
        let _ = client.inner.pending.lock().insert(
            7,
            PendingCommand {
                method: "Target.getTargets".into(),
                sent_at: Instant::now(),
                tx,
            },
        );

        client.inner.dispatch(r#"{"id":99,"result":{}}"#);
        assert_eq!(client.pending_commands(), 1);

        client.inner.dispatch(r#"{"id":7,"result":{"ok":true}}"#);
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
        assert_eq!(client.pending_commands(), 0);
    }

    #[tokio::test]
    async fn dispatch_maps_error_object() {
        let client = client();
        let (tx, rx) = oneshot::channel();
        let _ = client.inner.pending.lock().insert(
            1,
            PendingCommand {
                method: "DOM.getDocument".into(),
                sent_at: Instant::now(),
                tx,
            },
        );
        client
            .inner
            .dispatch(r#"{"id":1,"error":{"code":-32000,"message":"No node"}}"#);
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, CdpError::Protocol { ref message, .. } if message == "No node"));
    }

    #[tokio::test]
    async fn dispatch_republishes_events() {
        let client = client();
        let mut rx = client.subscribe();
        client
            .inner
            .dispatch(r#"{"method":"Page.loadEventFired","params":{"timestamp":1.5}}"#);
        match rx.recv().await.unwrap() {
            ClientEvent::Protocol { method, params } => {
                assert_eq!(method, "Page.loadEventFired");
                assert_eq!(params["timestamp"], 1.5);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fail_pending_drains_everything() {
        let client = client();
        let mut receivers = Vec::new();
        for id in 1..=3 {
            let (tx, rx) = oneshot::channel();
            let _ = client.inner.pending.lock().insert(
                id,
                PendingCommand {
                    method: "X.y".into(),
                    sent_at: Instant::now(),
                    tx,
                },
            );
            receivers.push(rx);
        }
        client.inner.fail_pending(|| CdpError::ConnectionClosed);
        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(CdpError::ConnectionClosed)));
        }
    }

    #[tokio::test]
    async fn stale_generation_close_is_ignored() {
        let client = client();
        let mut rx = client.subscribe();
        Inner::handle_close(&client.inner, 42);
        assert!(rx.try_recv().is_err());
        assert_eq!(client.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn disconnect_without_link_fails_pending_silently() {
        let client = client();
        let (tx, rx) = oneshot::channel();
        let _ = client.inner.pending.lock().insert(
            1,
            PendingCommand {
                method: "X.y".into(),
                sent_at: Instant::now(),
                tx,
            },
        );
        client.disconnect().await;
        assert!(matches!(rx.await.unwrap(), Err(CdpError::Disconnected)));
        assert!(!client.is_connected());
    }
}
