//! Check handler
//!
//! Categories run in sorted order, each in a fresh sandbox. Within a category
//! the code is loaded once and every fixture is called and validated in turn.
//! The first failure ends the check; the scoring variant decides what is
//! reported for it.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::environment::SandboxClient;
use crate::error::{ExecuteFailure, RefereeError};
use crate::fixture::TestFixture;
use crate::protocol::ResultAction;
use crate::validator::ValidatorResult;

use super::{CheckVariant, Handler, HandlerContext, HandlerState};

/// What the check reports once it is over
#[derive(Debug, Clone, PartialEq)]
struct CheckOutcome {
    success: bool,
    points: Option<i64>,
    additional_data: Option<Value>,
}

impl CheckOutcome {
    fn success(points: Option<i64>, additional_data: Option<Value>) -> Self {
        Self {
            success: true,
            points,
            additional_data,
        }
    }

    fn fail(points: Option<i64>, additional_data: Option<Value>) -> Self {
        Self {
            success: false,
            points,
            additional_data,
        }
    }
}

pub struct CheckHandler {
    ctx: HandlerContext,
    variant: CheckVariant,
    environment: Option<SandboxClient>,
}

impl CheckHandler {
    pub fn new(ctx: HandlerContext, variant: CheckVariant) -> Self {
        Self {
            ctx,
            variant,
            environment: None,
        }
    }

    fn result_action(&self) -> ResultAction {
        match self.ctx.action {
            super::Action::TryIt => ResultAction::TryIt,
            _ => ResultAction::Check,
        }
    }

    async fn run_categories(&mut self) -> Result<CheckOutcome> {
        let settings = Arc::clone(&self.ctx.settings);
        if settings.tests.is_empty() {
            anyhow::bail!("No tests configured for this mission");
        }

        let mut banked = 0;
        for (category, tests) in settings.tests.iter() {
            match self.check_category(category, tests).await {
                Ok(()) => {
                    if let CheckVariant::Rank(rank) = &self.variant {
                        banked += rank.points_for(category);
                    }
                }
                Err(e) => {
                    let failure = e.downcast::<RefereeError>()?;
                    return Ok(self.on_failure(failure, banked));
                }
            }
        }
        Ok(self.on_success(banked))
    }

    fn on_failure(&self, failure: RefereeError, banked: i64) -> CheckOutcome {
        warn!("CheckHandler:: {}", failure);
        match (&self.variant, &failure) {
            (CheckVariant::Rank(_), RefereeError::TestFailed(_)) if banked > 0 => {
                CheckOutcome::success(Some(banked), None)
            }
            _ => {
                let data = failure.failure();
                CheckOutcome::fail(data.points, Some(data.report_data()))
            }
        }
    }

    fn on_success(&self, banked: i64) -> CheckOutcome {
        match &self.variant {
            CheckVariant::Strict => CheckOutcome::success(None, None),
            CheckVariant::CodeGolf(golf) => {
                let (points, length) = golf.score(&self.ctx.env_name, &self.ctx.code);
                info!("CheckHandler:: golf points {} for code length {}", points, length);
                CheckOutcome::success(
                    Some(points),
                    Some(json!({ "description": format!("Code length: {}", length) })),
                )
            }
            CheckVariant::Rank(_) => CheckOutcome::success(Some(banked), None),
        }
    }

    async fn check_category(&mut self, category: &str, tests: &[TestFixture]) -> Result<()> {
        info!("CHECK:: Start Category '{}' checking", category);
        let environment = self.ctx.get_environment().await?;
        self.environment = Some(environment.clone());

        self.ctx.state.set(HandlerState::Configuring);
        let env_config = self.ctx.settings.env_config(&self.ctx.env_name);
        if let Err(e) = environment.set_config(env_config).await {
            environment.stop().await;
            return Err(e.into());
        }

        self.ctx.state.set(HandlerState::LoadingCode);
        if let Err(e) = environment.run_code(&self.ctx.code).await {
            environment.stop().await;
            if e.is_run_failed() {
                let description = format!("Category: {}. Code run failed", category);
                return Err(RefereeError::CodeRunFailed(ExecuteFailure::new(description)).into());
            }
            return Err(e.into());
        }

        self.ctx.state.set(HandlerState::RunningTests);
        for (index, test) in tests.iter().enumerate() {
            if let Err(e) = self.check_test_item(&environment, test, category, index).await {
                environment.stop().await;
                return Err(e);
            }
        }

        environment.stop().await;
        Ok(())
    }

    async fn check_test_item(
        &self,
        environment: &SandboxClient,
        test: &TestFixture,
        category: &str,
        index: usize,
    ) -> Result<()> {
        let settings = &self.ctx.settings;
        let function_name = test
            .function_name
            .as_deref()
            .unwrap_or_else(|| settings.function_name(&self.ctx.env_name));
        self.pre_test(test);

        let reply = match environment.run_function(function_name, test.input.clone()).await {
            Ok(reply) => reply,
            Err(e) if e.is_run_failed() => {
                let description = format!("Category: {}. Test {} Run failed", category, index);
                return Err(RefereeError::TestFailed(ExecuteFailure::new(description)).into());
            }
            Err(e) => return Err(e.into()),
        };

        let result = settings.validator.validate(test, &reply.result());
        self.post_test(&result, category, index);

        if !result.passed {
            let description = format!("Category: {}. Test {} Validate Failed", category, index);
            let failure = ExecuteFailure::new(description).with_additional_data(result.additional_data);
            return Err(RefereeError::TestFailed(failure).into());
        }
        Ok(())
    }

    fn pre_test(&self, test: &TestFixture) {
        let settings = &self.ctx.settings;
        let called = settings
            .representation(&self.ctx.env_name)
            .represent(test, settings.function_name(&self.ctx.env_name));
        info!("PRE_TEST:: Called: {}", called);
        if let Err(e) = self.ctx.session.send_pre_test(json!({ "representation": called })) {
            warn!("Failed to send pre_test: {}", e);
        }
    }

    fn post_test(&self, result: &ValidatorResult, category: &str, index: usize) {
        info!(
            "POST_TEST:: Check result for category {}, test {}: {}",
            category, index, result.passed
        );
        if let Some(data) = &result.additional_data {
            info!("VALIDATOR:: Data: {}", data);
            if let Err(e) = self.ctx.session.send_post_test(data.clone()) {
                warn!("Failed to send post_test: {}", e);
            }
        }
    }

    fn report(&self, outcome: CheckOutcome) -> Result<()> {
        self.ctx.session.send_result(
            self.result_action(),
            outcome.success,
            &self.ctx.code,
            outcome.points,
            outcome.additional_data,
        )?;
        Ok(())
    }
}

#[async_trait]
impl Handler for CheckHandler {
    async fn start(&mut self) -> Result<()> {
        info!("CheckHandler:: Start checking");
        let outcome = self.run_categories().await;

        self.ctx.state.set(HandlerState::Reporting);
        match outcome {
            Ok(outcome) => {
                self.report(outcome)?;
                self.ctx.state.set(HandlerState::Stopped);
                Ok(())
            }
            Err(e) => {
                if let Err(report_err) = self.report(CheckOutcome::fail(None, None)) {
                    error!("CheckHandler:: failed to report check failure: {}", report_err);
                }
                Err(e)
            }
        }
    }

    async fn stop(&mut self) {
        if let Some(environment) = self.environment.take() {
            environment.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::TestPlan;
    use crate::handlers::{Action, GolfScoring, HandlerSettings, RankScoring, StateTracker};
    use crate::representation::Representation;
    use crate::test_support::{count_stops, fake_session, summing_responder, FakeBroker, FakeProvider};
    use std::collections::HashMap;

    fn fixture(input: Value, answer: Value) -> TestFixture {
        TestFixture::new(input, answer)
    }

    fn handler(
        provider: Arc<FakeProvider>,
        settings: HandlerSettings,
        variant: CheckVariant,
        code: &str,
    ) -> (CheckHandler, FakeBroker) {
        let (session, broker) = fake_session();
        let ctx = HandlerContext {
            action: Action::Check,
            env_name: "python_3".into(),
            code: code.into(),
            session,
            environments: provider,
            settings: Arc::new(settings),
            state: StateTracker::new(),
        };
        (CheckHandler::new(ctx, variant), broker)
    }

    #[tokio::test]
    async fn test_strict_check_success() {
        let mut plan = TestPlan::default();
        plan.insert("Basics", vec![fixture(json!([1, 2]), json!(3)), fixture(json!([2, 2]), json!(4))]);
        let provider = FakeProvider::new(&["python_3"], summing_responder());
        let (mut check, mut broker) = handler(
            provider.clone(),
            HandlerSettings::default().with_tests(plan),
            CheckVariant::Strict,
            "def checkio(a, b): return a + b",
        );

        check.start().await.unwrap();
        check.stop().await;

        let pre_test = broker.next_with_method("pre_test").await;
        assert_eq!(pre_test["data"], json!({"representation": "checkio([1, 2])"}));
        let result = broker.next_with_method("result").await;
        assert_eq!(result["data"]["action"], "check");
        assert_eq!(result["data"]["success"], true);
        assert!(result["data"].get("points").is_none());

        let log = &provider.logs()[0];
        let first = log.lock().unwrap()[0].clone();
        assert_eq!(first, json!({"action": "config", "env_config": {}}));
        assert_eq!(count_stops(log), 1);
    }

    #[tokio::test]
    async fn test_strict_failure_short_circuits_categories() {
        let mut plan = TestPlan::default();
        plan.insert("A", vec![fixture(json!([1, 1]), json!(2)), fixture(json!([1, 1]), json!(3))]);
        plan.insert("B", vec![fixture(json!([0, 0]), json!(0))]);
        let provider = FakeProvider::new(&["python_3"], summing_responder());
        let (mut check, mut broker) = handler(
            provider.clone(),
            HandlerSettings::default().with_tests(plan),
            CheckVariant::Strict,
            "code",
        );

        check.start().await.unwrap();
        check.stop().await;

        let result = broker.next_with_method("result").await;
        assert_eq!(result["data"]["success"], false);
        assert_eq!(
            result["data"]["additional_data"]["description"],
            "Category: A. Test 1 Validate Failed"
        );

        // B was never acquired, A was stopped exactly once
        let logs = provider.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(count_stops(&logs[0]), 1);
    }

    #[tokio::test]
    async fn test_code_run_failure_aborts_check() {
        let mut plan = TestPlan::default();
        plan.insert("Rank_01", vec![fixture(json!([1]), json!(1))]);
        let provider = FakeProvider::new(
            &["python_3"],
            Arc::new(|request| match request["action"].as_str() {
                Some("run_code") => Some(json!({"status": "fail"})),
                _ => Some(json!({"status": "success"})),
            }),
        );
        let (mut check, mut broker) = handler(
            provider.clone(),
            HandlerSettings::default().with_tests(plan),
            CheckVariant::Rank(RankScoring::default()),
            "syntax error(",
        );

        check.start().await.unwrap();

        let result = broker.next_with_method("result").await;
        assert_eq!(result["data"]["success"], false);
        assert_eq!(
            result["data"]["additional_data"]["description"],
            "Category: Rank_01. Code run failed"
        );
        let requests = provider.logs()[0].lock().unwrap().clone();
        assert!(requests.iter().all(|r| r["action"] != "run_function"));
    }

    #[tokio::test]
    async fn test_rank_keeps_banked_points() {
        let mut plan = TestPlan::default();
        plan.insert("R1", vec![fixture(json!([1, 1]), json!(2))]);
        plan.insert("R2", vec![fixture(json!([1, 1]), json!(5))]);
        let rank = RankScoring {
            category_points: HashMap::from([("R1".to_string(), 100), ("R2".to_string(), 100)]),
        };
        let provider = FakeProvider::new(&["python_3"], summing_responder());
        let (mut check, mut broker) = handler(
            provider.clone(),
            HandlerSettings::default().with_tests(plan),
            CheckVariant::Rank(rank),
            "code",
        );

        check.start().await.unwrap();

        let result = broker.next_with_method("result").await;
        assert_eq!(result["data"]["success"], true);
        assert_eq!(result["data"]["points"], 100);
        assert_eq!(provider.logs().len(), 2);
    }

    #[tokio::test]
    async fn test_golf_scores_code_length() {
        let mut plan = TestPlan::default();
        plan.insert("Basics", vec![fixture(json!([2, 3]), json!(5))]);
        let golf = GolfScoring {
            default_max_length: 50,
            base_points: 10,
            ..Default::default()
        };
        let provider = FakeProvider::new(&["python_3"], summing_responder());
        let (mut check, mut broker) = handler(
            provider,
            HandlerSettings::default().with_tests(plan),
            CheckVariant::CodeGolf(golf),
            "checkio=lambda a,b:a+b",
        );

        check.start().await.unwrap();

        let result = broker.next_with_method("result").await;
        assert_eq!(result["data"]["points"], 10 + 50 - 22);
        assert_eq!(result["data"]["additional_data"], json!({"description": "Code length: 22"}));
    }

    #[tokio::test]
    async fn test_function_override_config_and_representation() {
        let mut plan = TestPlan::default();
        plan.insert(
            "Basics",
            vec![fixture(json!([4, 5]), json!(9)).with_function_name("add")],
        );
        let mut settings = HandlerSettings::default().with_tests(plan);
        settings.cover_codes.insert("python_3".into(), "def cover(f, d): return f(*d)".into());
        settings.random_seed = Some(7);
        settings.representations.insert("python_3".into(), Representation::UnwrapArgs);

        let provider = FakeProvider::new(&["python_3"], summing_responder());
        let (mut check, mut broker) = handler(provider.clone(), settings, CheckVariant::Strict, "code");

        check.start().await.unwrap();

        let pre_test = broker.next_with_method("pre_test").await;
        assert_eq!(pre_test["data"]["representation"], "checkio(4, 5)");

        let requests = provider.logs()[0].lock().unwrap().clone();
        assert_eq!(
            requests[0]["env_config"],
            json!({"cover_code": "def cover(f, d): return f(*d)", "random_seed": 7})
        );
        assert_eq!(requests[2]["function_name"], "add");
    }

    #[tokio::test]
    async fn test_sandbox_crash_fails_only_with_run_failed() {
        let mut plan = TestPlan::default();
        plan.insert("A", vec![fixture(json!([1]), json!(1))]);
        let provider = FakeProvider::new(
            &["python_3"],
            Arc::new(|request| match request["action"].as_str() {
                Some("run_function") => None,
                _ => Some(json!({"status": "success"})),
            }),
        );
        let (mut check, mut broker) = handler(
            provider,
            HandlerSettings::default().with_tests(plan),
            CheckVariant::Strict,
            "code",
        );

        check.start().await.unwrap();
        check.stop().await;

        let result = broker.next_with_method("result").await;
        assert_eq!(result["data"]["success"], false);
        assert_eq!(
            result["data"]["additional_data"]["description"],
            "Category: A. Test 0 Run failed"
        );
    }
}
