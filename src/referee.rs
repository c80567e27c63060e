//! Referee - one editor session from handshake to teardown
//!
//! Pulls the initial editor data, dispatches the requested action to its
//! handler, and tears every sandbox down when the handler finishes, the
//! broker cancels, or the connection is lost.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::RefereeConfig;
use crate::environment::{EnvironmentProvider, EnvironmentsController};
use crate::handlers::{Action, HandlerContext, HandlerRegistry, HandlerSettings, StateTracker};
use crate::session::SessionClient;

pub struct Referee {
    session: SessionClient,
    environments: Arc<dyn EnvironmentProvider>,
    registry: HandlerRegistry,
    settings: Arc<HandlerSettings>,
    state: StateTracker,
    shutdown: Arc<Notify>,
}

impl Referee {
    /// Connect to the broker and set up the sandbox pool
    pub async fn connect(config: RefereeConfig) -> Result<Self> {
        let broker = &config.broker;
        let session = SessionClient::connect(&broker.host, broker.port, broker.identity())
            .await
            .with_context(|| format!("Failed to connect to broker at {}:{}", broker.host, broker.port))?;

        let mission = config.mission;
        let controller = EnvironmentsController::new(mission.environments);
        Ok(Self::new(
            session,
            Arc::new(controller),
            mission.handlers,
            mission.settings,
        ))
    }

    pub fn new(
        session: SessionClient,
        environments: Arc<dyn EnvironmentProvider>,
        registry: HandlerRegistry,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            session,
            environments,
            registry,
            settings: Arc::new(settings),
            state: StateTracker::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Notified to abandon the session and tear down
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Serve the session to completion. Sandboxes are always stopped on return.
    pub async fn run(self) -> Result<()> {
        self.install_callbacks();

        let outcome = tokio::select! {
            result = self.on_ready() => Some(result),
            _ = self.shutdown.notified() => None,
        };

        let result = match outcome {
            Some(Ok(())) => {
                info!("Referee:: session finished");
                Ok(())
            }
            Some(Err(e)) => {
                error!("Referee:: session failed: {:#}", e);
                if let Err(send_err) = self.session.send_error(&format!("{:#}", e), Some(format!("{:?}", e))) {
                    warn!("Referee:: could not report error: {}", send_err);
                }
                Err(e)
            }
            None => {
                warn!("Referee:: session cancelled, tearing down");
                Ok(())
            }
        };

        self.teardown().await;
        result
    }

    fn install_callbacks(&self) {
        let shutdown = self.shutdown.clone();
        self.session.on_cancel(move |_| {
            info!("Referee:: cancel received");
            shutdown.notify_one();
        });

        let shutdown = self.shutdown.clone();
        self.session.set_close_callback(move || {
            shutdown.notify_one();
        });

        let session = self.session.downgrade();
        let state = self.state.clone();
        self.session.on_get_status(move |_| {
            let Some(session) = session.upgrade() else {
                return;
            };
            if let Err(e) = session.send_status(json!({ "state": state.get() })) {
                warn!("Referee:: could not report status: {}", e);
            }
        });
    }

    async fn on_ready(&self) -> Result<()> {
        let data = self
            .session
            .send_select_data(&["code", "action", "env_name"])
            .await
            .context("Failed to fetch editor data")?;
        debug!("Referee:: editor data {}", data);

        let action_name = data
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Editor data has no action"))?;
        let action: Action = action_name.parse()?;
        let kind = self
            .registry
            .get(action)
            .ok_or_else(|| anyhow!("Handler for action {} is not available", action))?;

        let env_name = data.get("env_name").and_then(Value::as_str).unwrap_or_default();
        if !self.environments.is_valid_env(env_name) {
            bail!("Environment {} is not supported", env_name);
        }
        let code = data.get("code").and_then(Value::as_str).unwrap_or_default();
        info!("Referee:: {} in {}", action, env_name);

        let ctx = HandlerContext {
            action,
            env_name: env_name.to_string(),
            code: code.to_string(),
            session: self.session.clone(),
            environments: self.environments.clone(),
            settings: self.settings.clone(),
            state: self.state.clone(),
        };
        let mut handler = kind.build(ctx);
        let result = handler.start().await;
        handler.stop().await;
        result
    }

    async fn teardown(&self) {
        let stopped = self.environments.stop_all().await;
        debug!("Referee:: teardown stopped {} sandboxes", stopped);
        self.session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{TestFixture, TestPlan};
    use crate::test_support::{count_stops, fake_session, summing_responder, FakeBroker, FakeProvider};
    use std::time::Duration;

    fn settings() -> HandlerSettings {
        let mut plan = TestPlan::default();
        plan.insert("Basics", vec![TestFixture::new(json!([1, 2]), json!(3))]);
        HandlerSettings::default().with_tests(plan)
    }

    async fn answer_select(broker: &mut FakeBroker, data: Value) {
        let select = broker.next_with_method("select").await;
        assert_eq!(select["data"], json!(["code", "action", "env_name"]));
        broker
            .reply("select_result", data, select["request_id"].as_str())
            .await;
    }

    #[tokio::test]
    async fn test_check_session_end_to_end() {
        let provider = FakeProvider::new(&["python_3"], summing_responder());
        let (session, mut broker) = fake_session();
        let referee = Referee::new(session, provider.clone(), HandlerRegistry::default(), settings());
        let running = tokio::spawn(referee.run());

        answer_select(
            &mut broker,
            json!({"code": "def checkio(a, b): return a + b", "action": "check", "env_name": "python_3"}),
        )
        .await;

        let result = broker.next_with_method("result").await;
        assert_eq!(result["data"]["success"], true);
        running.await.unwrap().unwrap();

        // Session is closed after teardown
        assert!(broker.drain().await.iter().all(|p| p["method"] != "result"));
        assert_eq!(count_stops(&provider.logs()[0]), 1);
    }

    #[tokio::test]
    async fn test_unavailable_action_sends_error() {
        let provider = FakeProvider::new(&["python_3"], summing_responder());
        let (session, mut broker) = fake_session();
        let referee = Referee::new(session, provider.clone(), HandlerRegistry::default(), settings());
        let running = tokio::spawn(referee.run());

        answer_select(&mut broker, json!({"code": "", "action": "try_it", "env_name": "python_3"})).await;

        let error = broker.next_with_method("error").await;
        assert!(error["data"]["message"]
            .as_str()
            .unwrap()
            .contains("try_it is not available"));
        assert!(running.await.unwrap().is_err());
        assert!(provider.logs().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_env_sends_error() {
        let provider = FakeProvider::new(&["python_3"], summing_responder());
        let (session, mut broker) = fake_session();
        let referee = Referee::new(session, provider, HandlerRegistry::default(), settings());
        let running = tokio::spawn(referee.run());

        answer_select(&mut broker, json!({"code": "", "action": "run", "env_name": "cobol"})).await;

        let error = broker.next_with_method("error").await;
        assert!(error["data"]["message"].as_str().unwrap().contains("cobol"));
        assert!(running.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_cancel_stops_live_sandbox_without_result() {
        let provider = FakeProvider::new(&["python_3"], summing_responder());
        let (session, mut broker) = fake_session();
        let referee = Referee::new(session, provider.clone(), HandlerRegistry::default(), settings());
        let running = tokio::spawn(referee.run());

        answer_select(
            &mut broker,
            json!({"code": "a = 1", "action": "run_in_console", "env_name": "python_3"}),
        )
        .await;
        // The console now waits for its next snippet
        let select = broker.next_with_method("select").await;
        assert_eq!(select["data"], json!(["code"]));
        broker.reply("cancel", json!({}), None).await;

        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let packets = broker.drain().await;
        assert!(packets.iter().all(|p| p["method"] != "result"));
        assert_eq!(count_stops(&provider.logs()[0]), 1);
    }

    #[tokio::test]
    async fn test_get_status_reports_handler_state() {
        let provider = FakeProvider::new(&["python_3"], summing_responder());
        let (session, mut broker) = fake_session();
        let referee = Referee::new(session, provider, HandlerRegistry::default(), settings());
        let running = tokio::spawn(referee.run());

        broker.next_with_method("select").await;
        broker.reply("get_status", json!({}), None).await;
        let status = broker.next_with_method("status").await;
        assert_eq!(status["data"], json!({"state": "idle"}));

        broker.reply("cancel", json!({}), None).await;
        running.await.unwrap().unwrap();
    }
}
