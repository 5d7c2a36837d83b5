//! HTTP gateway implementation.
//!
//! Posts the message as JSON to a configured endpoint and maps the response
//! status class onto the transient/permanent failure split: timeouts,
//! connection failures, 408, 429 and 5xx are transient; any other 4xx is
//! permanent. A 2xx response may carry `{"reference": "..."}`; providers
//! that return none get a locally generated reference.

use std::{future::Future, pin::Pin, time::Duration};

use serde::Deserialize;
use url::Url;
use uuid::Uuid;

use super::{Gateway, ProviderReference, SendError};

#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    endpoint: Url,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    reference: Option<String>,
}

impl HttpGateway {
    pub fn new(endpoint: Url, timeout: Duration) -> eyre::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("driftq/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, endpoint })
    }
}

impl Gateway for HttpGateway {
    fn send(
        &self,
        recipient: &str,
        body: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderReference, SendError>> + Send + 'static>> {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let payload = serde_json::json!({
            "recipient": recipient,
            "body": body,
        });

        Box::pin(async move {
            let response = client
                .post(endpoint)
                .json(&payload)
                .send()
                .await
                .map_err(categorize_request_error)?;

            let status = response.status();

            if status.is_success() {
                let reference = response
                    .json::<SendResponse>()
                    .await
                    .ok()
                    .and_then(|r| r.reference)
                    .unwrap_or_else(|| format!("http-{}", Uuid::new_v4()));

                return Ok(ProviderReference(reference));
            }

            let detail = response.text().await.unwrap_or_default();
            let message = format!("gateway returned {status}: {detail}");

            if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
                Err(SendError::transient(message))
            } else {
                Err(SendError::permanent(message))
            }
        })
    }
}

fn categorize_request_error(e: reqwest::Error) -> SendError {
    // Everything that never reached the provider, or timed out in transit,
    // is retryable.
    if e.is_timeout() || e.is_connect() || e.is_request() {
        SendError::transient(e.to_string())
    } else {
        SendError::permanent(e.to_string())
    }
}
