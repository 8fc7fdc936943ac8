//! Symptom analysis action.
//!
//! Analysis runs for every caller. Only a caller the session resolver verified gets
//! the result appended to their history, and a failed save never fails the request.

use crate::analysis::{AnalysisError, AnalysisRequest, AnalysisResult, SymptomAnalyzer};
use crate::diagnosis::{DiagnosisStore, NewDiagnosis};
use crate::server::resolver::ServerSessionResolver;
use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AnalysisResponse {
    pub message: String,
    pub result: Option<AnalysisResult>,
    pub error: Option<String>,
}

impl AnalysisResponse {
    fn failed(message: &str, error: impl Into<String>) -> Self {
        Self {
            message: message.to_string(),
            result: None,
            error: Some(error.into()),
        }
    }

    fn complete(message: &str, result: AnalysisResult) -> Self {
        Self {
            message: message.to_string(),
            result: Some(result),
            error: None,
        }
    }
}

#[utoipa::path(
    post,
    path= "/api/analysis",
    request_body = AnalysisRequest,
    responses (
        (status = 200, description = "Analysis finished", body = AnalysisResponse),
        (status = 400, description = "Validation failed", body = AnalysisResponse),
        (status = 502, description = "Analysis service failed", body = AnalysisResponse),
        (status = 503, description = "Analysis service not configured", body = AnalysisResponse)
    ),
    tag = "analysis",
)]
/// Analyze symptoms, saving the result for a signed-in caller.
pub async fn analyze(
    headers: HeaderMap,
    resolver: Extension<Arc<ServerSessionResolver>>,
    store: Extension<Arc<dyn DiagnosisStore>>,
    analyzer: Extension<Arc<dyn SymptomAnalyzer>>,
    body: Bytes,
) -> impl IntoResponse {
    let request = match serde_json::from_slice::<AnalysisRequest>(&body) {
        Ok(request) => request,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(AnalysisResponse::failed(
                    "Validation failed",
                    format!("Invalid input. {err}"),
                )),
            );
        }
    };
    if let Err(message) = request.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(AnalysisResponse::failed("Validation failed", message)),
        );
    }

    let result = match analyzer.analyze(&request).await {
        Ok(result) => result,
        Err(err) => {
            error!("Symptom analysis failed: {}", err);
            let status = match err {
                AnalysisError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            return (
                status,
                Json(AnalysisResponse::failed(
                    "Analysis failed",
                    "An error occurred during analysis. Please try again.",
                )),
            );
        }
    };

    let Some(caller) = resolver.resolve(&headers).await else {
        return (
            StatusCode::OK,
            Json(AnalysisResponse::complete("Analysis complete", result)),
        );
    };

    let diagnosis = NewDiagnosis {
        symptoms: request.symptoms,
        medical_history: request.medical_history.unwrap_or_default(),
        result: result.clone(),
    };
    let message = match store.save(&caller.uid, diagnosis).await {
        Ok(id) => {
            info!(%id, uid = %caller.uid, "diagnosis saved to history");
            "Analysis complete and saved"
        }
        Err(err) => {
            error!(uid = %caller.uid, "Failed to save diagnosis: {}", err);
            "Analysis complete, but failed to save to history."
        }
    };

    (
        StatusCode::OK,
        Json(AnalysisResponse::complete(message, result)),
    )
}
