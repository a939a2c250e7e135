//! Inference backend client.
//!
//! One trait seam so the chat service can be tested against a scripted
//! backend, and one real implementation that POSTs the composed query to the
//! configured HTTP endpoint.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::BackendSection;
use crate::error::ServiceError;

/// Anything that can turn a composed query into an answer.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn submit(&self, question: &str) -> Result<String, ServiceError>;
}

#[derive(Debug, Serialize)]
struct InferRequest<'a> {
    question: &'a str,
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    data: InferData,
}

#[derive(Debug, Deserialize)]
struct InferData {
    text: String,
}

/// HTTP client for the inference service.
pub struct HttpBackend {
    client: reqwest::Client,
    infer_url: String,
    timeout_secs: u64,
}

impl HttpBackend {
    /// Build the client from the `[backend]` config section.
    ///
    /// The client certificate is optional: when the cert or key file is
    /// absent the connection is made without client auth and the backend
    /// decides whether to accept it.
    pub fn new(config: &BackendSection) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .use_rustls_tls();

        if !config.auth.verify_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }

        if config.auth.cert_file.exists() && config.auth.key_file.exists() {
            let mut pem = std::fs::read(&config.auth.cert_file).with_context(|| {
                format!("reading client cert {}", config.auth.cert_file.display())
            })?;
            pem.extend(std::fs::read(&config.auth.key_file).with_context(|| {
                format!("reading client key {}", config.auth.key_file.display())
            })?);
            let identity =
                reqwest::Identity::from_pem(&pem).context("parsing client certificate")?;
            builder = builder.identity(identity);
        } else {
            debug!("client certificate not present, connecting without client auth");
        }

        if let Some(proxy) = &config.proxies.http {
            builder = builder.proxy(reqwest::Proxy::http(proxy).context("invalid http proxy")?);
        }
        if let Some(proxy) = &config.proxies.https {
            builder = builder.proxy(reqwest::Proxy::https(proxy).context("invalid https proxy")?);
        }

        let client = builder.build().context("building backend http client")?;
        let infer_url = format!("{}/infer", config.endpoint.trim_end_matches('/'));

        Ok(Self {
            client,
            infer_url,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    #[instrument(skip(self, question), fields(url = %self.infer_url))]
    async fn submit(&self, question: &str) -> Result<String, ServiceError> {
        let response = self
            .client
            .post(&self.infer_url)
            .json(&InferRequest { question })
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ServiceError::BackendTimeout(self.timeout_secs)
                } else {
                    ServiceError::BackendUnavailable(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::BackendUnavailable(format!(
                "backend answered with status {status}"
            )));
        }

        let body: InferResponse = response.json().await.map_err(|err| {
            ServiceError::BackendUnavailable(format!("malformed backend response: {err}"))
        })?;

        debug!(chars = body.data.text.len(), "backend answered");
        Ok(body.data.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_url_strips_trailing_slash() {
        let config = BackendSection {
            endpoint: "https://lightspeed.example.com/".to_string(),
            ..BackendSection::default()
        };
        let backend = HttpBackend::new(&config).unwrap();
        assert_eq!(backend.infer_url, "https://lightspeed.example.com/infer");
    }

    #[test]
    fn test_response_body_shape() {
        let body: InferResponse =
            serde_json::from_str(r#"{"data": {"text": "use df -h"}}"#).unwrap();
        assert_eq!(body.data.text, "use df -h");

        assert!(serde_json::from_str::<InferResponse>(r#"{"text": "bare"}"#).is_err());
    }
}
