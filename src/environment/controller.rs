//! Sandbox pool controller
//!
//! Spawns one subprocess per requested environment, waits for it to connect
//! back with a handshake, and tracks every live sandbox until it is released.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, OnceCell};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SandboxError;
use crate::protocol::Handshake;

use super::client::{ReleaseHook, SandboxClient, SandboxConnection};
use super::server::{ConnectionSink, EnvironmentsServer};
use super::{EnvironmentProvider, LineCallback, OutputCallbacks};

/// How long a released sandbox may take to exit before it is killed
pub const STOP_GRACE: Duration = Duration::from_secs(3);

/// Pool configuration
#[derive(Debug, Clone)]
pub struct EnvironmentsConfig {
    /// Environment name -> sandbox executable
    pub executables: HashMap<String, PathBuf>,
    pub listen_host: String,
    /// 0 picks an ephemeral port
    pub listen_port: u16,
    pub request_timeout: Option<Duration>,
    /// Extra variables for sandbox subprocesses
    pub env: Vec<(String, String)>,
}

impl Default for EnvironmentsConfig {
    fn default() -> Self {
        Self {
            executables: HashMap::new(),
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            request_timeout: None,
            env: Vec::new(),
        }
    }
}

impl EnvironmentsConfig {
    pub fn with_executable(mut self, env_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.executables.insert(env_name.into(), path.into());
        self
    }
}

type HandshakeResult = Result<SandboxConnection, SandboxError>;

struct LiveEnvironment {
    client: SandboxClient,
    child: Option<Child>,
}

#[derive(Default)]
struct Registry {
    pending: HashMap<String, oneshot::Sender<HandshakeResult>>,
    live: HashMap<String, LiveEnvironment>,
}

struct ControllerInner {
    config: EnvironmentsConfig,
    registry: Mutex<Registry>,
    server: OnceCell<EnvironmentsServer>,
}

impl ControllerInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route a handshake to the spawn waiting for that environment id
    fn on_connection_message(&self, handshake: Handshake, connection: SandboxConnection) {
        let Some(environment_id) = handshake.environment_id.clone() else {
            error!("Sandbox handshake without environment_id, dropping connection");
            return;
        };

        let Some(waiter) = self.registry().pending.remove(&environment_id) else {
            warn!("Handshake for unknown environment {}, dropping connection", environment_id);
            return;
        };

        let outcome = handshake.connected_id().map(|_| connection);
        if outcome.is_err() {
            error!("Wrong connection message for environment {}: {:?}", environment_id, handshake.status);
        }
        if waiter.send(outcome).is_err() {
            debug!("Spawn for environment {} was abandoned", environment_id);
        }
    }

    fn on_environment_released(&self, environment_id: &str) {
        let removed = self.registry().live.remove(environment_id);
        match removed {
            Some(environment) => {
                debug!("Released environment {}", environment_id);
                if let Some(child) = environment.child {
                    reap(environment_id.to_string(), child);
                }
            }
            None => debug!("Environment {} was already released", environment_id),
        }
    }
}

/// Owns the listening socket and every live sandbox
pub struct EnvironmentsController {
    inner: Arc<ControllerInner>,
}

impl EnvironmentsController {
    /// Create a new controller. The listener is bound on first use.
    pub fn new(config: EnvironmentsConfig) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                config,
                registry: Mutex::new(Registry::default()),
                server: OnceCell::new(),
            }),
        }
    }

    pub fn executable_path(&self, env_name: &str) -> Option<&Path> {
        self.inner.config.executables.get(env_name).map(PathBuf::as_path)
    }

    pub fn live_count(&self) -> usize {
        self.inner.registry().live.len()
    }

    /// Port sandboxes connect back to, binding the listener if needed
    pub async fn listen_port(&self) -> Result<u16, SandboxError> {
        Ok(self.server().await?.port())
    }

    async fn server(&self) -> Result<&EnvironmentsServer, SandboxError> {
        self.inner
            .server
            .get_or_try_init(|| async {
                let weak: Weak<ControllerInner> = Arc::downgrade(&self.inner);
                let sink: ConnectionSink = Arc::new(move |handshake, connection| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_connection_message(handshake, connection);
                    }
                });
                EnvironmentsServer::bind(
                    &self.inner.config.listen_host,
                    self.inner.config.listen_port,
                    sink,
                )
                .await
            })
            .await
    }

    /// Start a sandbox for `env_name` and wait until it is connected
    pub async fn get_environment(
        &self,
        env_name: &str,
        output: OutputCallbacks,
    ) -> Result<SandboxClient, SandboxError> {
        let executable = self
            .executable_path(env_name)
            .ok_or_else(|| SandboxError::UnknownEnvironment(env_name.to_string()))?
            .to_path_buf();
        self.spawn(&executable, output).await
    }

    /// Spawn `executable <port> <environment_id>` and wait for its handshake.
    ///
    /// Fails with `SandboxError::Protocol` if the handshake is malformed or the
    /// process exits before connecting.
    pub async fn spawn(
        &self,
        executable: &Path,
        output: OutputCallbacks,
    ) -> Result<SandboxClient, SandboxError> {
        let port = self.listen_port().await?;
        let environment_id = Uuid::new_v4().simple().to_string();
        let handshake = self.expect_handshake(&environment_id);

        let mut command = Command::new(executable);
        command
            .arg(port.to_string())
            .arg(&environment_id)
            .env_clear()
            .env("PYTHONUNBUFFERED", "1")
            .envs(self.inner.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.inner.registry().pending.remove(&environment_id);
                error!("Failed to spawn sandbox {:?}: {}", executable, e);
                return Err(e.into());
            }
        };
        info!("Spawned sandbox {} ({:?})", environment_id, executable);

        if let Some(stdout) = child.stdout.take() {
            forward_lines(environment_id.clone(), stdout, output.on_stdout.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(environment_id.clone(), stderr, output.on_stderr.clone());
        }

        let outcome = tokio::select! {
            received = handshake => received.unwrap_or_else(|_| {
                Err(SandboxError::Protocol(format!("handshake for {} was cancelled", environment_id)))
            }),
            status = child.wait() => Err(SandboxError::Protocol(match status {
                Ok(status) => format!("sandbox {} exited before connecting: {}", environment_id, status),
                Err(e) => format!("sandbox {} could not be awaited: {}", environment_id, e),
            })),
        };

        match outcome {
            Ok(connection) => {
                info!("Sandbox {} connected", environment_id);
                Ok(self.adopt(environment_id, connection, Some(child)))
            }
            Err(e) => {
                self.inner.registry().pending.remove(&environment_id);
                error!("{}", e);
                Err(e)
            }
        }
    }

    /// Register a pending spawn; resolves when its handshake arrives
    pub(crate) fn expect_handshake(&self, environment_id: &str) -> oneshot::Receiver<HandshakeResult> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .registry()
            .pending
            .insert(environment_id.to_string(), tx);
        rx
    }

    /// Track a connected sandbox and hand out its client
    pub(crate) fn adopt(
        &self,
        environment_id: String,
        connection: SandboxConnection,
        child: Option<Child>,
    ) -> SandboxClient {
        let weak = Arc::downgrade(&self.inner);
        let on_release: ReleaseHook = Arc::new(move |environment_id: &str| {
            if let Some(inner) = weak.upgrade() {
                inner.on_environment_released(environment_id);
            }
        });

        let client = SandboxClient::new(
            environment_id.clone(),
            connection,
            Some(on_release),
            self.inner.config.request_timeout,
        );
        self.inner.registry().live.insert(
            environment_id,
            LiveEnvironment {
                client: client.clone(),
                child,
            },
        );
        client
    }

    /// Stop every live sandbox concurrently and wait for all of them
    pub async fn stop_all(&self) -> usize {
        let clients: Vec<SandboxClient> = {
            let mut registry = self.inner.registry();
            // Dropping the senders fails any spawn still waiting for a handshake
            registry.pending.clear();
            registry.live.values().map(|env| env.client.clone()).collect()
        };

        let count = clients.len();
        let mut stops = JoinSet::new();
        for client in clients {
            stops.spawn(async move { client.stop().await });
        }
        while let Some(joined) = stops.join_next().await {
            if let Err(e) = joined {
                warn!("Sandbox stop task failed: {}", e);
            }
        }
        if count > 0 {
            info!("Stopped {} sandboxes", count);
        }
        count
    }
}

#[async_trait]
impl EnvironmentProvider for EnvironmentsController {
    fn is_valid_env(&self, env_name: &str) -> bool {
        self.inner.config.executables.contains_key(env_name)
    }

    async fn acquire(
        &self,
        env_name: &str,
        output: OutputCallbacks,
    ) -> Result<SandboxClient, SandboxError> {
        self.get_environment(env_name, output).await
    }

    async fn stop_all(&self) -> usize {
        EnvironmentsController::stop_all(self).await
    }
}

/// Stream a child pipe line by line into a callback
fn forward_lines<R>(environment_id: String, stream: R, callback: LineCallback)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                    }
                    callback(&environment_id, &String::from_utf8_lossy(&buf));
                }
                Err(e) => {
                    warn!("Failed to read output of sandbox {}: {}", environment_id, e);
                    break;
                }
            }
        }
    });
}

/// Give a released sandbox a grace period to exit, then kill it
fn reap(environment_id: String, mut child: Child) {
    tokio::spawn(async move {
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("Sandbox {} exited: {}", environment_id, status),
            Ok(Err(e)) => warn!("Failed to wait for sandbox {}: {}", environment_id, e),
            Err(_) => {
                warn!("Sandbox {} did not exit within {:?}, killing", environment_id, STOP_GRACE);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill sandbox {}: {}", environment_id, e);
                }
            }
        }
    });
}
