//! Diagnosis history of the verified caller.

use crate::analysis::AnalysisResult;
use crate::diagnosis::{DiagnosisRecord, DiagnosisStore};
use crate::server::handlers::session::ErrorResponse;
use crate::server::resolver::ServerSessionResolver;
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub symptoms: String,
    pub medical_history: String,
    pub result: AnalysisResult,
    /// RFC 3339.
    pub created_at: String,
}

impl From<DiagnosisRecord> for HistoryEntry {
    fn from(record: DiagnosisRecord) -> Self {
        Self {
            id: record.id.to_string(),
            symptoms: record.symptoms,
            medical_history: record.medical_history,
            result: record.result,
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

#[utoipa::path(
    get,
    path= "/api/history",
    responses (
        (status = 200, description = "Caller's diagnoses, newest first", body = [HistoryEntry]),
        (status = 401, description = "No verified session", body = ErrorResponse),
        (status = 500, description = "History could not be read", body = ErrorResponse)
    ),
    tag = "analysis",
)]
/// List the signed-in caller's saved diagnoses.
pub async fn history(
    headers: HeaderMap,
    resolver: Extension<Arc<ServerSessionResolver>>,
    store: Extension<Arc<dyn DiagnosisStore>>,
) -> Response {
    let Some(caller) = resolver.resolve(&headers).await else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new("Sign in to view your history")),
        )
            .into_response();
    };

    match store.list(&caller.uid).await {
        Ok(records) => {
            debug!(uid = %caller.uid, count = records.len(), "history listed");
            let entries: Vec<HistoryEntry> = records.into_iter().map(HistoryEntry::from).collect();
            (StatusCode::OK, Json(entries)).into_response()
        }
        Err(err) => {
            error!(uid = %caller.uid, "Failed to list diagnoses: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("Could not load history")),
            )
                .into_response()
        }
    }
}
