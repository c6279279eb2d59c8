//! HTTP client for the cluster API.

use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

use crate::command::command_argv;
use crate::config::ApiConfig;
use crate::target::{Allocation, ExecutionTarget};

/// Header carrying the ACL token.
pub const TOKEN_HEADER: &str = "X-Nomad-Token";

/// API client errors.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid api address {0}")]
    InvalidAddress(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("permission denied; check the ACL token")]
    Forbidden,

    #[error("unexpected response status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Result type for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Builds `<address>/v1/<segments...>`.
fn api_url(config: &ApiConfig, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(&config.address)
        .map_err(|e| ApiError::InvalidAddress(format!("{}: {}", config.address, e)))?;

    url.path_segments_mut()
        .map_err(|_| ApiError::InvalidAddress(config.address.clone()))?
        .pop_if_empty()
        .push("v1")
        .extend(segments);

    Ok(url)
}

fn append_scope(url: &mut Url, config: &ApiConfig) {
    if config.namespace.is_none() && config.region.is_none() {
        return;
    }
    let mut query = url.query_pairs_mut();
    if let Some(namespace) = &config.namespace {
        query.append_pair("namespace", namespace);
    }
    if let Some(region) = &config.region {
        query.append_pair("region", region);
    }
}

/// Websocket URL of the exec endpoint for `target` running `command`.
///
/// The command is sent as a JSON array of its whitespace-separated words.
pub fn exec_url(config: &ApiConfig, target: &ExecutionTarget, command: &str) -> Result<Url> {
    let mut url = api_url(
        config,
        &["client", "allocation", target.allocation_id.as_str(), "exec"],
    )?;

    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(ApiError::InvalidAddress(format!(
                "{}: unsupported scheme {}",
                config.address, other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ApiError::InvalidAddress(config.address.clone()))?;

    let argv = serde_json::to_string(&command_argv(command))
        .map_err(|e| ApiError::InvalidAddress(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("task", &target.task)
        .append_pair("tty", "true")
        .append_pair("command", &argv);
    append_scope(&mut url, config);

    Ok(url)
}

/// Client for the cluster HTTP API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: ApiConfig,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Result<Self> {
        api_url(&config, &[])?;
        Ok(Self {
            http: reqwest::Client::new(),
            config,
        })
    }

    /// Lists the allocations of `job`.
    pub async fn job_allocations(&self, job: &str) -> Result<Vec<Allocation>> {
        let mut url = api_url(&self.config, &["job", job, "allocations"])?;
        append_scope(&mut url, &self.config);

        tracing::debug!(%url, "Listing job allocations");

        let mut request = self.http.get(url);
        if let Some(token) = &self.config.token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request.send().await?;
        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(ApiError::JobNotFound(job.to_string())),
            StatusCode::FORBIDDEN => Err(ApiError::Forbidden),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ApiError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}
