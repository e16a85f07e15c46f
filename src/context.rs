use crate::backtest_api_client::{build_async_client, BacktestApi, HttpBacktestApi};
use crate::config::PanelSettings;
use crate::orchestrator::Orchestrator;
use crate::poller::PollerConfig;
use anyhow::Result;
use log::info;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    settings: PanelSettings,
}

impl AppContext {
    pub fn initialize(settings: PanelSettings) -> Self {
        Self { settings }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::initialize(PanelSettings::from_env()?))
    }

    pub fn settings(&self) -> &PanelSettings {
        &self.settings
    }

    pub fn api(&self) -> Result<HttpBacktestApi> {
        let base_url = self.settings.require_api_base_url()?;
        let http = build_async_client(Some(self.settings.request_timeout))?;
        Ok(HttpBacktestApi::new(
            http,
            base_url,
            self.settings.api_secret.clone(),
        ))
    }

    pub async fn orchestrator(&self) -> Result<Orchestrator> {
        let api = self.api()?;
        info!("Using trading service API at {}", api.base_url());
        let api: Arc<dyn BacktestApi> = Arc::new(api);
        Ok(Orchestrator::initialize(api, PollerConfig::from(&self.settings)).await)
    }
}
