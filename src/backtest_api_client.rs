use crate::error::{PanelError, PanelResult};
use crate::models::{BacktestRequest, JobId, JobSnapshot};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::time::Duration;

const PANEL_API_MTLS_CA_CERT_ENV: &str = "PANEL_API_MTLS_CA_CERT";
const PANEL_API_MTLS_CLIENT_CERT_ENV: &str = "PANEL_API_MTLS_CLIENT_CERT";
const PANEL_API_MTLS_CLIENT_KEY_ENV: &str = "PANEL_API_MTLS_CLIENT_KEY";
const SECRET_HEADER: &str = "x-panel-secret";
const MAX_ERROR_BODY_CHARS: usize = 2048;

/// The remote backtest engine, as seen by the orchestrator.
#[async_trait]
pub trait BacktestApi: Send + Sync {
    async fn submit_backtest(&self, request: &BacktestRequest) -> PanelResult<JobId>;

    async fn get_backtest_snapshot(&self, job_id: &JobId) -> PanelResult<JobSnapshot>;

    async fn list_models(&self) -> PanelResult<Vec<String>>;
}

fn env_path(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn load_mtls_ca_certificate() -> Result<Option<Certificate>> {
    let Some(path) = env_path(PANEL_API_MTLS_CA_CERT_ENV) else {
        return Ok(None);
    };
    let pem = fs::read(&path)
        .with_context(|| format!("failed to read mTLS CA certificate from {}", path))?;
    let certificate = Certificate::from_pem(&pem)
        .with_context(|| format!("failed to parse mTLS CA certificate from {}", path))?;
    Ok(Some(certificate))
}

fn load_mtls_identity() -> Result<Option<Identity>> {
    let cert_path = env_path(PANEL_API_MTLS_CLIENT_CERT_ENV);
    let key_path = env_path(PANEL_API_MTLS_CLIENT_KEY_ENV);

    match (cert_path, key_path) {
        (None, None) => Ok(None),
        (Some(_), None) | (None, Some(_)) => Err(anyhow!(
            "{} and {} must both be set when enabling API mTLS",
            PANEL_API_MTLS_CLIENT_CERT_ENV,
            PANEL_API_MTLS_CLIENT_KEY_ENV
        )),
        (Some(cert_path), Some(key_path)) => {
            let mut identity_pem = fs::read(&cert_path).with_context(|| {
                format!("failed to read mTLS client certificate from {}", cert_path)
            })?;
            let key_pem = fs::read(&key_path)
                .with_context(|| format!("failed to read mTLS client key from {}", key_path))?;
            if !identity_pem.ends_with(b"\n") {
                identity_pem.push(b'\n');
            }
            identity_pem.extend_from_slice(&key_pem);

            let identity = Identity::from_pem(&identity_pem).with_context(|| {
                format!(
                    "failed to parse mTLS client identity from {} and {}",
                    cert_path, key_path
                )
            })?;
            Ok(Some(identity))
        }
    }
}

pub fn build_async_client(timeout: Option<Duration>) -> Result<Client> {
    let mut builder = Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(certificate) = load_mtls_ca_certificate()? {
        builder = builder.add_root_certificate(certificate);
    }
    if let Some(identity) = load_mtls_identity()? {
        builder = builder.identity(identity);
    }
    builder.build().context("failed to build HTTP client")
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(alias = "id")]
    job_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModelsResponse {
    List(Vec<String>),
    Wrapped { models: Vec<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct StartRequest {
    pub symbol: String,
    pub market_type: String,
    pub timeframe: String,
    pub investment_amount: f64,
    pub leverage: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineStatus {
    pub running: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandAck {
    pub status: String,
}

#[derive(Clone)]
pub struct HttpBacktestApi {
    http: Client,
    base_url: String,
    api_secret: Option<String>,
}

impl HttpBacktestApi {
    pub fn new(http: Client, base_url: &str, api_secret: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_secret: api_secret
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn engine_status(&self) -> PanelResult<EngineStatus> {
        let request = self.http.get(self.url("/status"));
        self.send_json(request).await
    }

    pub async fn start_engine(&self, start: &StartRequest) -> PanelResult<CommandAck> {
        let request = self.http.post(self.url("/start")).json(start);
        self.send_json(request).await
    }

    pub async fn stop_engine(&self) -> PanelResult<CommandAck> {
        let request = self.http.post(self.url("/stop"));
        self.send_json(request).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_json<T: DeserializeOwned>(&self, mut request: RequestBuilder) -> PanelResult<T> {
        if let Some(secret) = self.api_secret.as_deref() {
            request = request.header(SECRET_HEADER, secret);
        }
        let response = request.send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

async fn ensure_success(response: Response) -> PanelResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PanelError::Api {
        status: status.as_u16(),
        body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
    })
}

#[async_trait]
impl BacktestApi for HttpBacktestApi {
    async fn submit_backtest(&self, request: &BacktestRequest) -> PanelResult<JobId> {
        let builder = self.http.post(self.url("/backtest")).json(request);
        let submitted: SubmitResponse = self.send_json(builder).await?;
        let job_id = submitted.job_id.trim();
        if job_id.is_empty() {
            return Err(PanelError::Api {
                status: 200,
                body: "submission response carried an empty job id".to_string(),
            });
        }
        Ok(JobId::new(job_id))
    }

    async fn get_backtest_snapshot(&self, job_id: &JobId) -> PanelResult<JobSnapshot> {
        let builder = self
            .http
            .get(self.url(&format!("/backtest/{}", job_id.as_str())));
        self.send_json(builder).await
    }

    async fn list_models(&self) -> PanelResult<Vec<String>> {
        let builder = self.http.get(self.url("/models"));
        let models = match self.send_json::<ModelsResponse>(builder).await? {
            ModelsResponse::List(models) | ModelsResponse::Wrapped { models } => models,
        };
        Ok(models
            .into_iter()
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty())
            .collect())
    }
}
