use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::environment::SandboxClient;

use super::{run_env_config, Handler, HandlerContext, HandlerState};

/// Interactive console: each snippet runs in the same sandbox until one fails
pub struct RunInConsoleHandler {
    ctx: HandlerContext,
    environment: Option<SandboxClient>,
}

impl RunInConsoleHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self {
            ctx,
            environment: None,
        }
    }

    async fn next_snippet(&self) -> Result<String> {
        let data = self.ctx.session.send_select_data(&["code"]).await?;
        Ok(data
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

#[async_trait]
impl Handler for RunInConsoleHandler {
    async fn start(&mut self) -> Result<()> {
        let environment = self.ctx.get_environment().await?;
        self.environment = Some(environment.clone());

        if let Some(config) = run_env_config(&self.ctx.env_name) {
            self.ctx.state.set(HandlerState::Configuring);
            environment.set_config(config).await?;
        }

        let mut code = self.ctx.code.clone();
        loop {
            self.ctx.state.set(HandlerState::LoadingCode);
            match environment.run_in_console(&code).await {
                Ok(_) => {}
                Err(e) if e.is_run_failed() => {
                    info!("Console session ended: {}", e);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
            code = self.next_snippet().await?;
        }

        environment.stop().await;
        self.ctx.state.set(HandlerState::Stopped);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(environment) = self.environment.take() {
            environment.stop().await;
        }
    }
}
