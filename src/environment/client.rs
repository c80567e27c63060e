//! Sandbox RPC client
//!
//! One client per live sandbox connection. Requests are strictly sequential:
//! a request is written only after the reply to the previous one was read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::SandboxError;
use crate::protocol::{decode_json, FrameReader, FrameWriter, SandboxReply, SandboxRequest, SANDBOX_DELIMITER};

/// How long `stop` waits for the sandbox to acknowledge or close
pub const STOP_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Invoked once with the environment id when the client is released
pub type ReleaseHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Framed halves of a sandbox connection
pub struct SandboxConnection {
    reader: FrameReader,
    writer: FrameWriter,
}

impl SandboxConnection {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self::from_parts(
            FrameReader::new(reader, SANDBOX_DELIMITER),
            FrameWriter::new(writer, SANDBOX_DELIMITER),
        )
    }

    /// Wrap halves whose reader may already have buffered past the handshake
    pub fn from_parts(reader: FrameReader, writer: FrameWriter) -> Self {
        Self { reader, writer }
    }

    /// Write one request and read frames until a JSON reply arrives.
    /// `Ok(None)` means the sandbox closed the connection.
    async fn exchange(
        &mut self,
        environment_id: &str,
        request: &SandboxRequest,
    ) -> Result<Option<Value>, SandboxError> {
        self.writer.write_json(request).await.map_err(|e| {
            SandboxError::run_failed(format!("failed to send {}: {}", request.action(), e), None)
        })?;

        loop {
            let frame = self.reader.read_frame().await.map_err(|e| {
                SandboxError::run_failed(format!("failed to read reply: {}", e), None)
            })?;
            let Some(frame) = frame else {
                return Ok(None);
            };
            match decode_json::<Value>(&frame) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => warn!(
                    "Dropped malformed frame from sandbox {}: {}",
                    environment_id, e
                ),
            }
        }
    }
}

struct ClientInner {
    environment_id: String,
    connection: Mutex<SandboxConnection>,
    stop_requested: AtomicBool,
    released: watch::Sender<bool>,
    on_release: Option<ReleaseHook>,
    request_timeout: Option<Duration>,
}

/// Handle to one live sandbox. Cheap to clone.
#[derive(Clone)]
pub struct SandboxClient {
    inner: Arc<ClientInner>,
}

impl SandboxClient {
    /// Create a new client over an already handshaken connection
    pub fn new(
        environment_id: impl Into<String>,
        connection: SandboxConnection,
        on_release: Option<ReleaseHook>,
        request_timeout: Option<Duration>,
    ) -> Self {
        let (released, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                environment_id: environment_id.into(),
                connection: Mutex::new(connection),
                stop_requested: AtomicBool::new(false),
                released,
                on_release,
                request_timeout,
            }),
        }
    }

    pub fn environment_id(&self) -> &str {
        &self.inner.environment_id
    }

    /// True once `stop` was called or the connection was lost
    pub fn is_stopping(&self) -> bool {
        self.inner.stop_requested.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        *self.inner.released.borrow()
    }

    pub async fn run_code(&self, code: &str) -> Result<SandboxReply, SandboxError> {
        self.request(SandboxRequest::RunCode {
            code: code.to_string(),
        })
        .await
    }

    pub async fn run_function(
        &self,
        function_name: &str,
        function_args: Value,
    ) -> Result<SandboxReply, SandboxError> {
        self.request(SandboxRequest::RunFunction {
            function_name: function_name.to_string(),
            function_args,
        })
        .await
    }

    pub async fn run_code_and_function(
        &self,
        code: &str,
        function_name: &str,
        function_args: Value,
    ) -> Result<SandboxReply, SandboxError> {
        self.request(SandboxRequest::RunCodeAndFunction {
            code: code.to_string(),
            function_name: function_name.to_string(),
            function_args,
        })
        .await
    }

    pub async fn run_in_console(&self, code: &str) -> Result<SandboxReply, SandboxError> {
        self.request(SandboxRequest::RunInConsole {
            code: code.to_string(),
        })
        .await
    }

    pub async fn set_config(&self, env_config: Value) -> Result<SandboxReply, SandboxError> {
        self.request(SandboxRequest::Config { env_config }).await
    }

    /// Send one request and wait for its reply.
    ///
    /// A non-success status, a lost connection and an elapsed request timeout
    /// all surface as `SandboxError::RunFailed`.
    pub async fn request(&self, request: SandboxRequest) -> Result<SandboxReply, SandboxError> {
        if self.is_stopping() {
            return Err(SandboxError::run_failed(
                format!("sandbox {} is stopping", self.environment_id()),
                None,
            ));
        }

        let action = request.action();
        let mut connection = self.inner.connection.lock().await;
        debug!("Sandbox {} <- {}", self.environment_id(), action);

        let exchanged = match self.inner.request_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, connection.exchange(self.environment_id(), &request)).await {
                    Ok(result) => result,
                    Err(_) => Err(SandboxError::run_failed(
                        format!("{} timed out after {:?}", action, limit),
                        None,
                    )),
                }
            }
            None => connection.exchange(self.environment_id(), &request).await,
        };
        drop(connection);

        let value = match exchanged {
            Ok(Some(value)) => value,
            Ok(None) => {
                info!("Sandbox {} closed the connection during {}", self.environment_id(), action);
                self.abandon();
                return Err(SandboxError::run_failed(
                    format!("sandbox closed the connection during {}", action),
                    None,
                ));
            }
            Err(e) => {
                warn!("Sandbox {} request {} failed: {}", self.environment_id(), action, e);
                self.abandon();
                return Err(e);
            }
        };

        let reply = SandboxReply::new(value);
        debug!(
            "Sandbox {} -> {} status {:?}",
            self.environment_id(),
            action,
            reply.status()
        );
        if !reply.is_success() {
            return Err(SandboxError::run_failed(
                format!("{} returned status {:?}", action, reply.status()),
                Some(reply.into_value()),
            ));
        }
        Ok(reply)
    }

    /// Ask the sandbox to stop and release it from the pool.
    ///
    /// Only the first call sends the `stop` frame. Later calls wait until the
    /// first one has released the sandbox, at most `STOP_ACK_TIMEOUT`.
    /// The sandbox is released even if the first call is dropped mid-exchange.
    pub async fn stop(&self) {
        if self.inner.stop_requested.swap(true, Ordering::SeqCst) {
            let mut released = self.inner.released.subscribe();
            if tokio::time::timeout(STOP_ACK_TIMEOUT, released.wait_for(|released| *released))
                .await
                .is_err()
            {
                warn!(
                    "Sandbox {} was not released within {:?}, releasing",
                    self.environment_id(),
                    STOP_ACK_TIMEOUT
                );
                self.release();
            }
            return;
        }

        let _release = ReleaseOnDrop(self);
        debug!("Stopping sandbox {}", self.environment_id());
        let mut connection = self.inner.connection.lock().await;
        let acknowledged = tokio::time::timeout(
            STOP_ACK_TIMEOUT,
            connection.exchange(self.environment_id(), &SandboxRequest::Stop),
        )
        .await;
        drop(connection);

        match acknowledged {
            Ok(Ok(Some(_))) => debug!("Sandbox {} acknowledged stop", self.environment_id()),
            Ok(Ok(None)) => debug!("Sandbox {} closed on stop", self.environment_id()),
            Ok(Err(e)) => warn!("Sandbox {} stop failed: {}", self.environment_id(), e),
            Err(_) => warn!(
                "Sandbox {} did not acknowledge stop within {:?}",
                self.environment_id(),
                STOP_ACK_TIMEOUT
            ),
        }
    }

    /// Give up on a broken connection without sending `stop`
    fn abandon(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.release();
    }

    fn release(&self) {
        if self.inner.released.send_replace(true) {
            return;
        }
        if let Some(hook) = &self.inner.on_release {
            hook(self.environment_id());
        }
    }
}

/// Releases the client when the owning `stop` finishes or is dropped
struct ReleaseOnDrop<'a>(&'a SandboxClient);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl std::fmt::Debug for SandboxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxClient")
            .field("environment_id", &self.inner.environment_id)
            .field("stopping", &self.is_stopping())
            .finish()
    }
}
