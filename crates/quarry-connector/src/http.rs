//! Generic HTTP connector over reqwest.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use async_trait::async_trait;

use crate::rate::RateClock;
use crate::types::{Connector, ConnectorRequest, ConnectorResponse};

/// JSON-over-HTTP connector. Maps transport failures to status 0 with a
/// message; upstream failures keep their status code. An optional contact
/// email is appended to every request as an identification parameter (the
/// polite-crawler convention for MediaWiki/OpenAlex-style APIs).
pub struct HttpConnector {
    name: String,
    client: reqwest::Client,
    rate: RateClock,
    contact_email: Option<String>,
}

impl HttpConnector {
    pub fn new(
        name: impl Into<String>,
        requests_per_second: f64,
        timeout: Duration,
        contact_email: Option<String>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("quarry/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            name: name.into(),
            client,
            rate: RateClock::new(requests_per_second),
            contact_email,
        })
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

#[async_trait]
impl Connector for HttpConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, request: &ConnectorRequest) -> ConnectorResponse {
        self.rate.pace().await;
        let start = Instant::now();

        let method = match request.method.parse::<reqwest::Method>() {
            Ok(m) => m,
            Err(_) => {
                return ConnectorResponse::transport_error(
                    format!("invalid HTTP method: {}", request.method),
                    0,
                );
            }
        };

        let mut builder = self.client.request(method, &request.uri);
        let mut params = request.params.clone();
        if let Some(email) = &self.contact_email {
            params.insert("mailto".to_string(), email.clone());
        }
        if !params.is_empty() {
            builder = builder.query(&params);
        }
        if let Some(headers) = &request.headers {
            for (key, value) in headers {
                builder = builder.header(key, value);
            }
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = match builder.send().await {
            Ok(resp) => resp,
            Err(err) => {
                return ConnectorResponse::transport_error(
                    err.to_string(),
                    start.elapsed().as_millis() as u64,
                );
            }
        };

        let status_code = response.status().as_u16();
        let retry_after_seconds = parse_retry_after(response.headers());
        let response_headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();

        let body = match response.text().await {
            Ok(text) => text,
            Err(err) => {
                return ConnectorResponse::transport_error(
                    format!("failed to read response body: {err}"),
                    start.elapsed().as_millis() as u64,
                );
            }
        };

        let payload: Value =
            serde_json::from_str(&body).unwrap_or_else(|_| Value::String(body));

        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(connector = %self.name, uri = %request.uri, status_code, duration_ms, "fetched");

        let error_message = if (200..300).contains(&status_code) {
            None
        } else {
            Some(format!("upstream returned status {status_code}"))
        };

        ConnectorResponse {
            status_code,
            payload,
            headers: Some(response_headers),
            duration_ms,
            error_message,
            retry_after_seconds,
        }
    }
}
