use std::{collections::HashMap, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::debug;
use reqwest::{header::RETRY_AFTER, StatusCode};
use serde::{Deserialize, Serialize};

use crate::{
    config::ClassifierConfig,
    models::{ImageRef, SourceKind, SourceLabels},
};

use super::{Classification, Classifier, ClassifyError};

const DEFAULT_TIMEOUT_SECS: u64 = 20;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyRequest<'a> {
    kind: &'a str,
    image_base64: String,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    labels: HashMap<String, f64>,
    #[serde(default)]
    primary: Option<String>,
}

/// JSON-over-HTTP classifier. Images are read from their local path and sent inline.
pub struct HttpClassifier {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpClassifier {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build classifier HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }

    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .context("classifier url is not configured")?;
        let timeout = Duration::from_secs(config.request_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
        Self::new(url, config.api_key.clone(), timeout)
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn map_transport_error(err: reqwest::Error) -> ClassifyError {
    if err.is_timeout() {
        ClassifyError::Timeout
    } else {
        ClassifyError::Transport(err.to_string())
    }
}

/// Status-code mapping shared by the adapter and its tests.
fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> Option<ClassifyError> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Some(ClassifyError::RateLimited { retry_after })
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        Some(ClassifyError::Timeout)
    } else if status.is_server_error() {
        Some(ClassifyError::Server(status.as_u16()))
    } else {
        Some(ClassifyError::Rejected(format!("status {status}")))
    }
}

fn parse_body(body: &str) -> Result<Classification, ClassifyError> {
    let response: ClassifyResponse =
        serde_json::from_str(body).map_err(|err| ClassifyError::ParseError(err.to_string()))?;
    Classification {
        labels: SourceLabels::new(response.labels),
        primary: response.primary,
    }
    .validated()
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, image: &ImageRef, kind: SourceKind) -> Result<Classification, ClassifyError> {
        let bytes = tokio::fs::read(&image.uri)
            .await
            .map_err(|err| ClassifyError::Rejected(format!("unreadable image {}: {err}", image.uri)))?;

        let payload = ClassifyRequest {
            kind: kind.as_str(),
            image_base64: STANDARD.encode(bytes),
        };
        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        if let Some(error) = classify_status(response.status(), parse_retry_after(&response)) {
            debug!("classifier answered {} for {}", response.status(), image.uri);
            return Err(error);
        }

        let body = response.text().await.map_err(map_transport_error)?;
        parse_body(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(7))),
            Some(ClassifyError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            })
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, None),
            Some(ClassifyError::Server(502))
        );
        assert_eq!(classify_status(StatusCode::GATEWAY_TIMEOUT, None), Some(ClassifyError::Timeout));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, None),
            Some(ClassifyError::Rejected(_))
        ));
        assert_eq!(classify_status(StatusCode::OK, None), None);
    }

    #[test]
    fn body_parsing() {
        let parsed = parse_body(r#"{"labels": {"HeadAway": 0.8, "Focused": 0.1}, "primary": "HeadAway"}"#).unwrap();
        assert_eq!(parsed.labels.primary_label(), Some("HeadAway"));

        assert!(matches!(parse_body("{\"labels\": "), Err(ClassifyError::ParseError(_))));
        assert!(matches!(parse_body(r#"{"labels": {}}"#), Err(ClassifyError::ParseError(_))));
    }

    #[tokio::test]
    async fn missing_image_is_rejected_without_a_request() {
        let classifier =
            HttpClassifier::new("http://127.0.0.1:9/classify", None, Duration::from_secs(1)).unwrap();
        let err = classifier
            .classify(&ImageRef::new("/nonexistent/frame.jpg"), SourceKind::Camera)
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifyError::Rejected(_)));
    }
}
