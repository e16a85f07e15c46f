use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use panel::{
    commands::{control, list_models, multi_run, single_run},
    config::parse_timeframes,
    context::AppContext,
};

#[derive(Parser)]
#[command(name = "panel")]
#[command(about = "Run and follow backtests on the trading service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest one strategy/model pair across several timeframes at once
    MultiRun {
        #[command(flatten)]
        batch: multi_run::BatchArgs,
        /// Comma separated timeframes (defaults to PANEL_TIMEFRAMES)
        #[arg(long)]
        timeframes: Option<String>,
    },
    /// Backtest a single timeframe
    Run {
        #[command(flatten)]
        batch: multi_run::BatchArgs,
        #[arg(long, default_value = "1h")]
        timeframe: String,
    },
    /// List the models the trading service can backtest
    Models,
    /// Show whether the live trading engine is running
    Status,
    /// Start the live trading engine
    Start {
        #[command(flatten)]
        args: control::StartArgs,
    },
    /// Stop the live trading engine
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let app_context = AppContext::from_env()?;

    match command {
        Commands::MultiRun { batch, timeframes } => {
            let timeframes = match timeframes {
                Some(raw) => parse_timeframes(&raw)?,
                None => app_context.settings().timeframes.clone(),
            };
            info!(
                "Running {} on {} across {}",
                batch.strategy,
                batch.symbol,
                timeframes.join(", ")
            );
            multi_run::run(&app_context, &batch.to_config(), &timeframes).await?;
        }
        Commands::Run { batch, timeframe } => {
            single_run::run(&app_context, &batch.to_config(), &timeframe).await?;
        }
        Commands::Models => list_models::run(&app_context).await?,
        Commands::Status => control::status(&app_context).await?,
        Commands::Start { args } => control::start(&app_context, &args).await?,
        Commands::Stop => control::stop(&app_context).await?,
    }

    Ok(())
}
