use crate::commands::multi_run::follow;
use crate::config::BatchConfig;
use crate::context::AppContext;
use anyhow::Result;
use log::info;

pub async fn run(app: &AppContext, config: &BatchConfig, timeframe: &str) -> Result<()> {
    let orchestrator = app.orchestrator().await?;
    let generation = orchestrator.run_single(config, timeframe).await?;
    info!(
        "Submitted single {} backtest (batch {}); following progress",
        timeframe, generation
    );
    follow(&orchestrator).await;
    orchestrator.dispose();
    Ok(())
}
