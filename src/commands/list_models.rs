use crate::backtest_api_client::BacktestApi;
use crate::context::AppContext;
use anyhow::{Context, Result};
use log::warn;

pub async fn run(app: &AppContext) -> Result<()> {
    let api = app.api()?;
    let models = api
        .list_models()
        .await
        .context("failed to fetch model list")?;
    if models.is_empty() {
        warn!("The trading service reported no models");
    }
    for model in models {
        println!("{}", model);
    }
    Ok(())
}
