use crate::config::{BatchConfig, CapitalSizing};
use crate::context::AppContext;
use crate::orchestrator::Orchestrator;
use crate::presentation::{BatchView, Tone, ViewState};
use anyhow::Result;
use clap::Args;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{info, warn};
use std::collections::HashMap;
use std::time::Duration;

const SPINNER_TICK: Duration = Duration::from_millis(120);

#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    /// Market symbol to backtest
    #[arg(long, default_value = "BTC/USDT")]
    pub symbol: String,
    /// Strategy identifier understood by the trading service
    #[arg(long)]
    pub strategy: String,
    /// Model identifier (see the `models` command)
    #[arg(long)]
    pub model: String,
    /// Lookback window in days
    #[arg(long, default_value_t = 7)]
    pub days: u32,
    /// Starting capital per backtest
    #[arg(long, default_value_t = 1000.0)]
    pub capital: f64,
    /// Multiply the starting capital by this leverage
    #[arg(long)]
    pub leverage: Option<u32>,
}

impl BatchArgs {
    pub fn to_config(&self) -> BatchConfig {
        let capital = match self.leverage {
            Some(leverage) => CapitalSizing::Leveraged {
                amount: self.capital,
                leverage,
            },
            None => CapitalSizing::Fixed {
                amount: self.capital,
            },
        };
        BatchConfig {
            symbol: self.symbol.clone(),
            strategy: self.strategy.clone(),
            model: self.model.clone(),
            days: self.days,
            capital,
        }
    }
}

pub async fn run(app: &AppContext, config: &BatchConfig, timeframes: &[String]) -> Result<()> {
    let orchestrator = app.orchestrator().await?;
    let generation = orchestrator.run_batch(config, timeframes).await?;
    info!("Batch {} submitted; following progress", generation);
    follow(&orchestrator).await;
    orchestrator.dispose();
    Ok(())
}

/// Re-renders the batch on every state change until it settles or the user interrupts.
pub(crate) async fn follow(orchestrator: &Orchestrator) {
    let status = orchestrator.status();
    let mut revisions = status.subscribe();
    let view_state = ViewState::new();
    let timeframes: Vec<String> = status
        .snapshot()
        .records
        .iter()
        .map(|record| record.timeframe.clone())
        .collect();
    let mut progress = BatchProgress::new(&timeframes);

    let settled = orchestrator.wait_until_settled();
    tokio::pin!(settled);
    loop {
        progress.update(&BatchView::project(&status.snapshot(), &view_state));
        tokio::select! {
            _ = &mut settled => break,
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted; stopping all pollers");
                orchestrator.dispose();
                break;
            }
        }
    }

    let view = BatchView::project(&status.snapshot(), &view_state);
    progress.finish(&view);
    println!("{}", view.render_text());
}

struct BatchProgress {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
    printed: HashMap<String, usize>,
}

impl BatchProgress {
    fn new(timeframes: &[String]) -> Self {
        let multi = MultiProgress::new();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} {prefix:>5} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        let bars = timeframes
            .iter()
            .map(|timeframe| {
                let bar = multi.add(ProgressBar::new_spinner());
                bar.set_style(style.clone());
                bar.set_prefix(timeframe.clone());
                bar.set_message("pending");
                bar.enable_steady_tick(SPINNER_TICK);
                (timeframe.clone(), bar)
            })
            .collect();
        Self {
            multi,
            bars,
            printed: HashMap::new(),
        }
    }

    fn update(&mut self, view: &BatchView) {
        for row in &view.rows {
            let Some(bar) = self.bars.get(&row.timeframe) else {
                continue;
            };
            let message = match (&row.error, &row.last_line) {
                (Some(error), _) => format!("{}: {}", row.badge.label, error),
                (None, Some(line)) => format!("{}: {}", row.badge.label, line),
                (None, None) => row.badge.label.to_string(),
            };
            match row.badge.tone {
                Tone::Neutral | Tone::Active => bar.set_message(message),
                Tone::Positive | Tone::Negative => {
                    if !bar.is_finished() {
                        bar.finish_with_message(message);
                    }
                }
            }
        }

        // The feed only holds the latest writer's log; print whatever part of it is new.
        let Some(first) = view.feed.first() else {
            return;
        };
        let printed = self.printed.entry(first.timeframe.clone()).or_insert(0);
        if view.feed.len() > *printed {
            for line in &view.feed[*printed..] {
                let _ = self.multi.println(line.tagged());
            }
            *printed = view.feed.len();
        }
    }

    fn finish(&mut self, view: &BatchView) {
        self.update(view);
        for bar in self.bars.values() {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    }
}
