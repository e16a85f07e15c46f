pub mod app_url;
pub mod backtest_api_client;
pub mod batch_status;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod log_feed;
pub mod models;
pub mod orchestrator;
pub mod poller;
pub mod presentation;
pub mod retry;

#[cfg(test)]
mod test_support;
