//! Broker session client
//!
//! Outbound packets go through a queue drained by a single writer task, so
//! pushes are written in the order they were issued. A reader task resolves
//! pending pulls and dispatches inbound methods through the signal bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::protocol::{FrameReader, FrameWriter, InMethod, InPacket, OutMethod, OutPacket, ResultAction, BROKER_DELIMITER};
use crate::signals::SignalBus;

/// Identifies this referee to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_connection_id: String,
    pub docker_id: String,
}

impl SessionIdentity {
    pub fn new(user_connection_id: impl Into<String>, docker_id: impl Into<String>) -> Self {
        Self {
            user_connection_id: user_connection_id.into(),
            docker_id: docker_id.into(),
        }
    }
}

pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

enum Outgoing {
    Packet(OutPacket),
    /// Acknowledged once every packet queued before it was written
    Flush(oneshot::Sender<()>),
    /// Flush, shut the stream down and stop writing
    Close(oneshot::Sender<()>),
}

#[derive(Default)]
struct PendingTable {
    closed: bool,
    requests: HashMap<String, oneshot::Sender<Value>>,
}

/// State shared with the reader task
#[derive(Default)]
struct Shared {
    pending: Mutex<PendingTable>,
    signals: SignalBus,
    close_callbacks: Mutex<Vec<CloseCallback>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close_callbacks(&self) -> MutexGuard<'_, Vec<CloseCallback>> {
        self.close_callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_frame(&self, frame: &[u8]) {
        debug!("SessionClient:: recv {}", String::from_utf8_lossy(frame));
        let packet = match InPacket::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                error!("SessionClient:: dropped inbound frame: {}", e);
                return;
            }
        };

        if let Some(request_id) = &packet.request_id {
            let waiter = self.pending().requests.remove(request_id);
            match waiter {
                Some(waiter) => {
                    if waiter.send(packet.data.clone()).is_err() {
                        debug!("SessionClient:: request {} was abandoned", request_id);
                    }
                }
                None => warn!(
                    "SessionClient:: {} for unknown request {}",
                    packet.method, request_id
                ),
            }
        }

        self.signals.dispatch(packet.method, &packet.data);
    }

    fn on_close(&self) {
        {
            let mut pending = self.pending();
            pending.closed = true;
            // Dropping the senders fails every outstanding pull
            pending.requests.clear();
        }
        let callbacks: Vec<CloseCallback> = self.close_callbacks().clone();
        for callback in callbacks {
            callback();
        }
    }

    fn is_closed(&self) -> bool {
        self.pending().closed
    }
}

struct SessionInner {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    shared: Arc<Shared>,
    result_sent: AtomicBool,
    reader_handle: JoinHandle<()>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Client side of the broker connection. Cheap to clone.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<SessionInner>,
}

/// Non-owning handle, for callbacks that must not keep the session alive
#[derive(Clone)]
pub struct WeakSessionClient {
    inner: Weak<SessionInner>,
}

impl WeakSessionClient {
    pub fn upgrade(&self) -> Option<SessionClient> {
        self.inner.upgrade().map(|inner| SessionClient { inner })
    }
}

impl SessionClient {
    /// Connect to the broker and send the `set` handshake
    pub async fn connect(host: &str, port: u16, identity: SessionIdentity) -> Result<Self, SessionError> {
        let stream = TcpStream::connect((host, port)).await?;
        let _ = stream.set_nodelay(true);
        info!("SessionClient:: connected to broker at {}:{}", host, port);
        let (read_half, write_half) = stream.into_split();
        Self::from_stream(read_half, write_half, identity)
    }

    /// Run a session over any byte stream pair
    pub fn from_stream(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        identity: SessionIdentity,
    ) -> Result<Self, SessionError> {
        let (outgoing, queue) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        tokio::spawn(write_loop(FrameWriter::new(writer, BROKER_DELIMITER), queue));
        let reader_handle = tokio::spawn(read_loop(
            FrameReader::new(reader, BROKER_DELIMITER),
            shared.clone(),
        ));

        let client = Self {
            inner: Arc::new(SessionInner {
                outgoing,
                shared,
                result_sent: AtomicBool::new(false),
                reader_handle,
            }),
        };
        client.push(
            OutMethod::Set,
            json!({
                "user_connection_id": identity.user_connection_id,
                "docker_id": identity.docker_id,
            }),
        )?;
        Ok(client)
    }

    pub fn downgrade(&self) -> WeakSessionClient {
        WeakSessionClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    /// Queue a packet for the writer task
    pub fn send_packet(&self, packet: OutPacket) -> Result<(), SessionError> {
        self.inner
            .outgoing
            .send(Outgoing::Packet(packet))
            .map_err(|_| SessionError::Closed)
    }

    fn push(&self, method: OutMethod, data: Value) -> Result<(), SessionError> {
        self.send_packet(OutPacket::new(method, data, None))
    }

    /// Pull editor data from the broker; resolves with the matching `select_result`
    pub async fn send_select_data(&self, fields: &[&str]) -> Result<Value, SessionError> {
        let request_id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.shared.pending();
            if pending.closed {
                return Err(SessionError::Closed);
            }
            pending.requests.insert(request_id.clone(), tx);
        }

        let packet = OutPacket::new(OutMethod::Select, json!(fields), Some(request_id.clone()));
        if let Err(e) = self.send_packet(packet) {
            self.inner.shared.pending().requests.remove(&request_id);
            return Err(e);
        }
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub fn send_stdout(&self, line: &str) -> Result<(), SessionError> {
        self.push(OutMethod::Stdout, Value::String(line.to_string()))
    }

    pub fn send_stderr(&self, line: &str) -> Result<(), SessionError> {
        self.push(OutMethod::Stderr, Value::String(line.to_string()))
    }

    /// Report the final outcome. Only the first call per session is sent.
    pub fn send_result(
        &self,
        action: ResultAction,
        success: bool,
        code: &str,
        points: Option<i64>,
        additional_data: Option<Value>,
    ) -> Result<(), SessionError> {
        if self.inner.result_sent.swap(true, Ordering::SeqCst) {
            warn!("SessionClient:: result for {} already sent, dropping", action.as_str());
            return Err(SessionError::ResultAlreadySent);
        }

        let mut data = Map::new();
        data.insert("action".into(), json!(action.as_str()));
        data.insert("success".into(), json!(success));
        data.insert("code".into(), json!(code));
        if let Some(points) = points {
            data.insert("points".into(), json!(points));
        }
        if let Some(additional_data) = additional_data {
            data.insert("additional_data".into(), additional_data);
        }
        info!(
            "SessionClient:: result action={} success={} points={:?}",
            action.as_str(),
            success,
            points
        );
        self.push(OutMethod::Result, Value::Object(data))
    }

    pub fn send_check_result(
        &self,
        success: bool,
        code: &str,
        points: Option<i64>,
        additional_data: Option<Value>,
    ) -> Result<(), SessionError> {
        self.send_result(ResultAction::Check, success, code, points, additional_data)
    }

    pub fn send_try_it_result(
        &self,
        success: bool,
        code: &str,
        points: Option<i64>,
        additional_data: Option<Value>,
    ) -> Result<(), SessionError> {
        self.send_result(ResultAction::TryIt, success, code, points, additional_data)
    }

    pub fn send_run_finish(&self, code: &str) -> Result<(), SessionError> {
        self.send_result(ResultAction::Run, true, code, None, None)
    }

    pub fn send_pre_test(&self, data: Value) -> Result<(), SessionError> {
        self.push(OutMethod::PreTest, data)
    }

    pub fn send_post_test(&self, data: Value) -> Result<(), SessionError> {
        self.push(OutMethod::PostTest, data)
    }

    pub fn send_error(&self, message: &str, traceback: Option<String>) -> Result<(), SessionError> {
        let mut data = Map::new();
        data.insert("message".into(), json!(message));
        if let Some(traceback) = traceback {
            data.insert("traceback".into(), json!(traceback));
        }
        self.push(OutMethod::Error, Value::Object(data))
    }

    pub fn send_status(&self, data: Value) -> Result<(), SessionError> {
        self.push(OutMethod::Status, data)
    }

    pub fn send_custom(&self, data: Value) -> Result<(), SessionError> {
        self.push(OutMethod::Custom, data)
    }

    /// Register a `cancel` callback; returns its dispatch uid
    pub fn on_cancel(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> Option<String> {
        self.on_method(InMethod::Cancel, callback)
    }

    /// Register a `get_status` callback; returns its dispatch uid
    pub fn on_get_status(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> Option<String> {
        self.on_method(InMethod::GetStatus, callback)
    }

    fn on_method(
        &self,
        method: InMethod,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Option<String> {
        self.inner.shared.signals.connect(
            method,
            Arc::new(move |data: &Value| {
                callback(data);
                Ok(())
            }),
        )
    }

    /// Called once when the broker connection is lost.
    /// Runs immediately if the connection is already gone.
    pub fn set_close_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        let callback: CloseCallback = Arc::new(callback);
        self.inner.shared.close_callbacks().push(callback.clone());
        if self.is_closed() {
            callback();
        }
    }

    /// Flush queued pushes and shut the connection down
    pub async fn close(&self) {
        let (ack, flushed) = oneshot::channel();
        if self.inner.outgoing.send(Outgoing::Close(ack)).is_ok() {
            let _ = flushed.await;
        }
        debug!("SessionClient:: closed");
    }

    /// Wait until every push issued so far has been written
    pub async fn flush(&self) -> Result<(), SessionError> {
        let (ack, flushed) = oneshot::channel();
        self.inner
            .outgoing
            .send(Outgoing::Flush(ack))
            .map_err(|_| SessionError::Closed)?;
        flushed.await.map_err(|_| SessionError::Closed)
    }
}

async fn write_loop(mut writer: FrameWriter, mut queue: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(item) = queue.recv().await {
        match item {
            Outgoing::Packet(packet) => {
                let bytes = match packet.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("SessionClient:: failed to encode {}: {}", packet.method, e);
                        continue;
                    }
                };
                debug!("SessionClient:: send {}", String::from_utf8_lossy(&bytes).trim_end());
                if let Err(e) = writer.write_raw(&bytes).await {
                    error!("SessionClient:: write to broker failed: {}", e);
                    break;
                }
            }
            Outgoing::Flush(ack) => {
                let _ = ack.send(());
            }
            Outgoing::Close(ack) => {
                if let Err(e) = writer.shutdown().await {
                    debug!("SessionClient:: shutdown failed: {}", e);
                }
                let _ = ack.send(());
                break;
            }
        }
    }
}

async fn read_loop(mut reader: FrameReader, shared: Arc<Shared>) {
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => shared.on_frame(&frame),
            Ok(None) => {
                info!("SessionClient:: broker closed the connection");
                break;
            }
            Err(e) => {
                error!("SessionClient:: read from broker failed: {}", e);
                break;
            }
        }
    }
    shared.on_close();
}
