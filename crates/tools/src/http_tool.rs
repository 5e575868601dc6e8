use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    Client, StatusCode,
    header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER},
};
use serde_json::Value;
use types::{
    FunctionDecl, HttpToolConfig, HttpToolSafety, SafetyTier, Tool, ToolContext, ToolError,
};
use url::Url;

use crate::{RegistryError, execution_failed, invalid_args, transient};

const PRINCIPAL_HEADER: &str = "x-wayfarer-principal";
const SESSION_HEADER: &str = "x-wayfarer-session";
const ERROR_BODY_MAX_CHARS: usize = 512;

/// External capability (flight search, booking, ...) reached by POSTing the
/// validated arguments as JSON to a configured endpoint.
///
/// Transport failures, 429 and 5xx are transient; any other non-success
/// status is final.
pub struct HttpTool {
    decl: FunctionDecl,
    endpoint: Url,
    headers: HeaderMap,
    safety_tier: SafetyTier,
    timeout: Duration,
    cache_ttl: Option<Duration>,
    client: Client,
}

impl HttpTool {
    pub fn from_config(config: &HttpToolConfig) -> Result<Self, RegistryError> {
        let name = config.name.trim().to_owned();
        let endpoint = Url::parse(config.endpoint.trim()).map_err(|error| {
            RegistryError::InvalidEndpoint {
                name: name.clone(),
                message: error.to_string(),
            }
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(RegistryError::InvalidEndpoint {
                name,
                message: format!("unsupported scheme `{}`", endpoint.scheme()),
            });
        }

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|error| {
                RegistryError::InvalidEndpoint {
                    name: name.clone(),
                    message: format!("invalid header name `{key}`: {error}"),
                }
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|error| {
                RegistryError::InvalidEndpoint {
                    name: name.clone(),
                    message: format!("invalid value for header `{key}`: {error}"),
                }
            })?;
            headers.insert(header_name, header_value);
        }

        let safety_tier = match config.safety {
            HttpToolSafety::ReadOnly => SafetyTier::ReadOnly,
            HttpToolSafety::SideEffecting => SafetyTier::SideEffecting,
            HttpToolSafety::Sensitive => SafetyTier::Sensitive,
        };
        // Only read-only results are ever served from cache.
        let cache_ttl = config
            .cache_ttl_secs
            .filter(|_| safety_tier.is_read_only())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            decl: FunctionDecl::new(
                name,
                config.description.clone(),
                config.parameters.clone(),
            ),
            endpoint,
            headers,
            safety_tier,
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            cache_ttl,
            client: Client::new(),
        })
    }

    fn name(&self) -> &str {
        &self.decl.name
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn schema(&self) -> FunctionDecl {
        self.decl.clone()
    }

    async fn execute(&self, args: &str, context: &ToolContext) -> Result<String, ToolError> {
        let body: Value = serde_json::from_str(args)
            .map_err(|error| invalid_args(self.name(), error.to_string()))?;

        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(PRINCIPAL_HEADER, context.principal_id.as_str())
            .header(SESSION_HEADER, context.session_id.as_str())
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|error| transient(self.name(), format!("request failed: {error}")))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let text = response
            .text()
            .await
            .map_err(|error| transient(self.name(), format!("failed to read response: {error}")))?;

        if status.is_success() {
            return Ok(text);
        }

        let detail = summarize_body(&text);
        tracing::debug!(
            tool = self.name(),
            status = status.as_u16(),
            "capability returned an error status"
        );
        if status == StatusCode::TOO_MANY_REQUESTS {
            let hint = retry_after.map_or(String::new(), |secs| format!(" (retry after {secs}s)"));
            return Err(transient(
                self.name(),
                format!("HTTP 429{hint}: {detail}"),
            ));
        }
        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            return Err(transient(
                self.name(),
                format!("HTTP {}: {detail}", status.as_u16()),
            ));
        }
        Err(execution_failed(
            self.name(),
            format!("HTTP {}: {detail}", status.as_u16()),
        ))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn safety_tier(&self) -> SafetyTier {
        self.safety_tier
    }

    fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }
}

fn summarize_body(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_owned();
    }
    if trimmed.chars().count() <= ERROR_BODY_MAX_CHARS {
        return trimmed.to_owned();
    }
    let mut summary = trimmed.chars().take(ERROR_BODY_MAX_CHARS).collect::<String>();
    summary.push_str("...");
    summary
}
