//! Per-user diagnosis history.
//!
//! Records are append-only and keyed by the verified caller uid. Only the analysis
//! handler writes here, and only after the session resolver produced a caller.

use crate::analysis::AnalysisResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{Instrument, debug, info_span};
use uuid::Uuid;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS diagnoses (
    id UUID PRIMARY KEY,
    user_id TEXT NOT NULL,
    symptoms TEXT NOT NULL,
    medical_history TEXT NOT NULL DEFAULT '',
    result TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("could not encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDiagnosis {
    pub symptoms: String,
    pub medical_history: String,
    pub result: AnalysisResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisRecord {
    pub id: Uuid,
    pub user_id: String,
    pub symptoms: String,
    pub medical_history: String,
    pub result: AnalysisResult,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait DiagnosisStore: Send + Sync {
    /// Append a record for `user_id` and return its id.
    async fn save(&self, user_id: &str, diagnosis: NewDiagnosis) -> Result<Uuid, StoreError>;

    /// Records for `user_id`, newest first.
    async fn list(&self, user_id: &str) -> Result<Vec<DiagnosisRecord>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    fn kind(&self) -> &'static str;
}

pub struct PgDiagnosisStore {
    pool: PgPool,
}

impl PgDiagnosisStore {
    /// Connect and make sure the table exists.
    ///
    /// # Errors
    /// Returns an error if the database is unreachable or the schema cannot be created.
    pub async fn connect(dsn: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// # Errors
    /// Returns an error if the statement fails.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let span = info_span!("db.query", db.system = "postgresql", db.operation = "CREATE");
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DiagnosisStore for PgDiagnosisStore {
    async fn save(&self, user_id: &str, diagnosis: NewDiagnosis) -> Result<Uuid, StoreError> {
        let query = "INSERT INTO diagnoses (id, user_id, symptoms, medical_history, result, created_at) VALUES ($1, $2, $3, $4, $5, $6)";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let id = Uuid::now_v7();
        let result = serde_json::to_string(&diagnosis.result)?;
        sqlx::query(query)
            .bind(id)
            .bind(user_id)
            .bind(&diagnosis.symptoms)
            .bind(&diagnosis.medical_history)
            .bind(result)
            .bind(Utc::now())
            .execute(&self.pool)
            .instrument(span)
            .await?;
        debug!(%id, "diagnosis saved");
        Ok(id)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<DiagnosisRecord>, StoreError> {
        let query = "SELECT id, user_id, symptoms, medical_history, result, created_at FROM diagnoses WHERE user_id = $1 ORDER BY created_at DESC";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await?;
        rows.iter()
            .map(|row| {
                let result: String = row.try_get("result")?;
                Ok(DiagnosisRecord {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    symptoms: row.try_get("symptoms")?,
                    medical_history: row.try_get("medical_history")?,
                    result: serde_json::from_str(&result)?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        conn.ping().await?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "postgres"
    }
}

/// Process-local store for development and tests.
#[derive(Default)]
pub struct MemoryDiagnosisStore {
    records: RwLock<HashMap<String, Vec<DiagnosisRecord>>>,
}

impl MemoryDiagnosisStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DiagnosisStore for MemoryDiagnosisStore {
    async fn save(&self, user_id: &str, diagnosis: NewDiagnosis) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        let record = DiagnosisRecord {
            id,
            user_id: user_id.to_string(),
            symptoms: diagnosis.symptoms,
            medical_history: diagnosis.medical_history,
            result: diagnosis.result,
            created_at: Utc::now(),
        };
        self.records
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .push(record);
        Ok(id)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<DiagnosisRecord>, StoreError> {
        let mut records = self
            .records
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default();
        records.reverse();
        Ok(records)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Condition, Urgency};

    fn diagnosis(symptoms: &str) -> NewDiagnosis {
        NewDiagnosis {
            symptoms: symptoms.to_string(),
            medical_history: String::new(),
            result: AnalysisResult {
                diagnosis: vec![Condition {
                    name: "Common cold".to_string(),
                    explanation: "Upper respiratory infection".to_string(),
                }],
                urgency: Urgency::Low,
                departments: vec!["General Medicine".to_string()],
            },
        }
    }

    #[tokio::test]
    async fn memory_store_keeps_records_per_user() {
        let store = MemoryDiagnosisStore::new();
        store.save("u1", diagnosis("first entry")).await.expect("save");
        store.save("u1", diagnosis("second entry")).await.expect("save");
        store.save("u2", diagnosis("other user")).await.expect("save");

        let records = store.list("u1").await.expect("list");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].symptoms, "second entry");
        assert!(store.list("nobody").await.expect("list").is_empty());
        assert_eq!(store.kind(), "memory");
    }
}
