use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::environment::SandboxClient;

use super::{run_env_config, Handler, HandlerContext, HandlerState};

/// Runs the submitted code once; failures are the user's output, not ours
pub struct RunHandler {
    ctx: HandlerContext,
    environment: Option<SandboxClient>,
}

impl RunHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self {
            ctx,
            environment: None,
        }
    }
}

#[async_trait]
impl Handler for RunHandler {
    async fn start(&mut self) -> Result<()> {
        info!("RunHandler:: running code in {}", self.ctx.env_name);
        let environment = self.ctx.get_environment().await?;
        self.environment = Some(environment.clone());

        if let Some(config) = run_env_config(&self.ctx.env_name) {
            self.ctx.state.set(HandlerState::Configuring);
            environment.set_config(config).await?;
        }

        self.ctx.state.set(HandlerState::LoadingCode);
        match environment.run_code(&self.ctx.code).await {
            Ok(_) => debug!("RunHandler:: code finished"),
            Err(e) if e.is_run_failed() => debug!("RunHandler:: code finished with failure: {}", e),
            Err(e) => return Err(e.into()),
        }
        environment.stop().await;

        self.ctx.state.set(HandlerState::Reporting);
        self.ctx.session.send_run_finish(&self.ctx.code)?;
        self.ctx.state.set(HandlerState::Stopped);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(environment) = self.environment.take() {
            environment.stop().await;
        }
    }
}
