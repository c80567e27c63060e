//! In-memory fakes for the sandbox and broker ends of the wire

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{ReadHalf, WriteHalf, DuplexStream};

use crate::environment::{EnvironmentProvider, OutputCallbacks, SandboxClient, SandboxConnection};
use crate::error::SandboxError;
use crate::protocol::{decode_json, FrameReader, FrameWriter, BROKER_DELIMITER, SANDBOX_DELIMITER};
use crate::session::{SessionClient, SessionIdentity};

/// Every request a fake sandbox received, in order
pub(crate) type RequestLog = Arc<Mutex<Vec<Value>>>;

pub(crate) type Responder = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Start a scripted sandbox. `respond` returns the reply to each request, or
/// `None` to close the connection. `stop` is always acknowledged.
pub(crate) fn fake_sandbox<F>(respond: F) -> (SandboxConnection, RequestLog)
where
    F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
{
    fake_sandbox_with(Arc::new(respond))
}

pub(crate) fn fake_sandbox_with(respond: Responder) -> (SandboxConnection, RequestLog) {
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let (our_read, our_write) = tokio::io::split(ours);
    let (their_read, their_write) = tokio::io::split(theirs);
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));

    let requests = log.clone();
    tokio::spawn(async move {
        let mut reader = FrameReader::new(their_read, SANDBOX_DELIMITER);
        let mut writer = FrameWriter::new(their_write, SANDBOX_DELIMITER);
        while let Ok(Some(frame)) = reader.read_frame().await {
            let Ok(request) = decode_json::<Value>(&frame) else {
                break;
            };
            requests.lock().unwrap().push(request.clone());

            let reply = if request["action"] == "stop" {
                let _ = writer.write_json(&json!({"status": "success"})).await;
                break;
            } else {
                respond(&request)
            };
            match reply {
                Some(reply) => {
                    if writer.write_json(&reply).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    });

    (SandboxConnection::new(our_read, our_write), log)
}

pub(crate) fn count_stops(log: &RequestLog) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .filter(|request| request["action"] == "stop")
        .count()
}

/// Replies `success` to everything; `run_function` returns the sum of its arguments
pub(crate) fn summing_responder() -> Responder {
    Arc::new(|request| {
        let result = match request["action"].as_str() {
            Some("run_function") => {
                let sum: i64 = request["function_args"]
                    .as_array()
                    .map(|args| args.iter().filter_map(Value::as_i64).sum())
                    .unwrap_or(0);
                json!(sum)
            }
            _ => Value::Null,
        };
        Some(json!({"status": "success", "result": result}))
    })
}

/// Environment provider handing out scripted in-memory sandboxes
pub(crate) struct FakeProvider {
    envs: Vec<String>,
    responder: Responder,
    acquired: Mutex<Vec<(SandboxClient, RequestLog)>>,
    counter: AtomicUsize,
}

impl FakeProvider {
    pub(crate) fn new(envs: &[&str], responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            envs: envs.iter().map(|e| e.to_string()).collect(),
            responder,
            acquired: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        })
    }

    /// Request logs of every sandbox handed out, in acquisition order
    pub(crate) fn logs(&self) -> Vec<RequestLog> {
        self.acquired
            .lock()
            .unwrap()
            .iter()
            .map(|(_, log)| log.clone())
            .collect()
    }
}

#[async_trait]
impl EnvironmentProvider for FakeProvider {
    fn is_valid_env(&self, env_name: &str) -> bool {
        self.envs.iter().any(|e| e == env_name)
    }

    async fn acquire(
        &self,
        env_name: &str,
        _output: OutputCallbacks,
    ) -> Result<SandboxClient, SandboxError> {
        if !self.is_valid_env(env_name) {
            return Err(SandboxError::UnknownEnvironment(env_name.to_string()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let (connection, log) = fake_sandbox_with(self.responder.clone());
        let client = SandboxClient::new(format!("fake-{}", n), connection, None, None);
        self.acquired.lock().unwrap().push((client.clone(), log));
        Ok(client)
    }

    async fn stop_all(&self) -> usize {
        let clients: Vec<SandboxClient> = self
            .acquired
            .lock()
            .unwrap()
            .iter()
            .filter(|(client, _)| !client.is_released())
            .map(|(client, _)| client.clone())
            .collect();
        for client in &clients {
            client.stop().await;
        }
        clients.len()
    }
}

/// Broker end of a session running over an in-memory stream
pub(crate) struct FakeBroker {
    reader: FrameReader,
    writer: FrameWriter,
}

impl FakeBroker {
    /// Next packet from the referee; `None` once the session shut down
    pub(crate) async fn next_packet(&mut self) -> Option<Value> {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.reader.read_frame())
            .await
            .expect("timed out waiting for a packet")
            .unwrap()?;
        Some(decode_json(&frame).unwrap())
    }

    /// Skip packets until one with `method` arrives
    pub(crate) async fn next_with_method(&mut self, method: &str) -> Value {
        loop {
            let packet = self.next_packet().await.expect("session closed");
            if packet["method"] == method {
                return packet;
            }
        }
    }

    /// Every packet until the session shuts down
    pub(crate) async fn drain(&mut self) -> Vec<Value> {
        let mut packets = Vec::new();
        while let Some(packet) = self.next_packet().await {
            packets.push(packet);
        }
        packets
    }

    pub(crate) async fn reply(&mut self, method: &str, data: Value, request_id: Option<&str>) {
        let mut packet = json!({"method": method, "data": data});
        if let Some(request_id) = request_id {
            packet["request_id"] = json!(request_id);
        }
        self.writer.write_json(&packet).await.unwrap();
    }

    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_raw(bytes).await.unwrap();
    }
}

pub(crate) fn fake_session() -> (SessionClient, FakeBroker) {
    let (ours, theirs) = tokio::io::duplex(256 * 1024);
    let (our_read, our_write): (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) =
        tokio::io::split(ours);
    let (their_read, their_write) = tokio::io::split(theirs);

    let session = SessionClient::from_stream(
        our_read,
        our_write,
        SessionIdentity::new("user-1", "docker-1"),
    )
    .unwrap();
    let broker = FakeBroker {
        reader: FrameReader::new(their_read, BROKER_DELIMITER),
        writer: FrameWriter::new(their_write, BROKER_DELIMITER),
    };
    (session, broker)
}
