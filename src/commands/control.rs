use crate::backtest_api_client::StartRequest;
use crate::context::AppContext;
use anyhow::{Context, Result};
use clap::Args;
use log::{info, warn};

#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    #[arg(long, default_value = "BTC/USDT")]
    pub symbol: String,
    /// `spot` or `future`
    #[arg(long, default_value = "future")]
    pub market_type: String,
    #[arg(long, default_value = "1h")]
    pub timeframe: String,
    #[arg(long, default_value_t = 100.0)]
    pub investment_amount: f64,
    #[arg(long, default_value_t = 1)]
    pub leverage: u32,
}

pub async fn status(app: &AppContext) -> Result<()> {
    let status = app
        .api()?
        .engine_status()
        .await
        .context("failed to read engine status")?;
    println!("{}", if status.running { "running" } else { "stopped" });
    Ok(())
}

pub async fn start(app: &AppContext, args: &StartArgs) -> Result<()> {
    let request = StartRequest {
        symbol: args.symbol.clone(),
        market_type: args.market_type.clone(),
        timeframe: args.timeframe.clone(),
        investment_amount: args.investment_amount,
        leverage: args.leverage,
    };
    let ack = app
        .api()?
        .start_engine(&request)
        .await
        .context("failed to start trading engine")?;
    match ack.status.as_str() {
        "started" => info!("Trading engine started for {}", request.symbol),
        "already_running" => warn!("Trading engine was already running"),
        other => warn!("Unexpected start response: {}", other),
    }
    Ok(())
}

pub async fn stop(app: &AppContext) -> Result<()> {
    let ack = app
        .api()?
        .stop_engine()
        .await
        .context("failed to stop trading engine")?;
    info!("Trading engine stop acknowledged ({})", ack.status);
    Ok(())
}
