//! Symptom analysis collaborator.
//!
//! The hosted inference service is reached over HTTP; this crate only defines the
//! request and result shapes and forwards them.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{Instrument, info_span};
use url::Url;
use utoipa::ToSchema;

const ANALYSIS_TIMEOUT_SECONDS: u64 = 60;
pub const MIN_SYMPTOMS_LENGTH: usize = 10;

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub symptoms: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medical_history: Option<String>,
    #[serde(default)]
    pub use_medical_history: bool,
}

impl AnalysisRequest {
    /// # Errors
    /// Returns the user-facing message when the symptoms are too short.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.symptoms.trim().chars().count() < MIN_SYMPTOMS_LENGTH {
            Err("Please describe your symptoms in more detail.")
        } else {
            Ok(())
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub name: String,
    pub explanation: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AnalysisResult {
    pub diagnosis: Vec<Condition>,
    pub urgency: Urgency,
    pub departments: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis service is not configured")]
    NotConfigured,
    #[error("analysis service unreachable: {0}")]
    Transport(String),
    #[error("analysis service returned status {0}")]
    Upstream(u16),
    #[error("analysis service returned an invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait SymptomAnalyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AnalysisError>;
}

/// Posts the request as JSON and expects an [`AnalysisResult`] back.
pub struct HttpSymptomAnalyzer {
    client: Client,
    url: Url,
}

impl HttpSymptomAnalyzer {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: Url) -> Result<Self, AnalysisError> {
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(Duration::from_secs(ANALYSIS_TIMEOUT_SECONDS))
            .build()
            .map_err(|e| AnalysisError::Transport(e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl SymptomAnalyzer for HttpSymptomAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AnalysisError> {
        let span = info_span!("analysis.request", http.method = "POST", url = %self.url);
        async {
            let response = self
                .client
                .post(self.url.clone())
                .json(request)
                .send()
                .await
                .map_err(|e| AnalysisError::Transport(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(AnalysisError::Upstream(status.as_u16()));
            }
            response
                .json::<AnalysisResult>()
                .await
                .map_err(|e| AnalysisError::InvalidResponse(e.to_string()))
        }
        .instrument(span)
        .await
    }
}

/// Used when no analysis endpoint was configured.
pub struct UnconfiguredAnalyzer;

#[async_trait]
impl SymptomAnalyzer for UnconfiguredAnalyzer {
    async fn analyze(&self, _request: &AnalysisRequest) -> Result<AnalysisResult, AnalysisError> {
        Err(AnalysisError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_accepts_camel_case_and_defaults() {
        let request: AnalysisRequest =
            serde_json::from_str(r#"{"symptoms":"headache and fever"}"#).expect("json");
        assert_eq!(request.medical_history, None);
        assert!(!request.use_medical_history);
        assert!(request.validate().is_ok());

        let short = AnalysisRequest {
            symptoms: " cough ".to_string(),
            medical_history: None,
            use_medical_history: false,
        };
        assert_eq!(
            short.validate(),
            Err("Please describe your symptoms in more detail.")
        );
    }

    #[test]
    fn result_uses_uppercase_urgency() {
        let result: AnalysisResult = serde_json::from_str(
            r#"{"diagnosis":[{"name":"Flu","explanation":"Viral"}],"urgency":"MEDIUM","departments":["General Medicine"]}"#,
        )
        .expect("json");
        assert_eq!(result.urgency, Urgency::Medium);
    }

    #[tokio::test]
    async fn unconfigured_analyzer_fails() {
        let request = AnalysisRequest {
            symptoms: "headache and fever".to_string(),
            medical_history: None,
            use_medical_history: false,
        };
        assert!(matches!(
            UnconfiguredAnalyzer.analyze(&request).await,
            Err(AnalysisError::NotConfigured)
        ));
    }
}
