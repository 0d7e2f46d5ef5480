//! SurrealDB-backed implementation of every Stagegate repository.
//!
//! Records are stored as a serialized `body` next to the handful of columns
//! the store filters, orders or guards on. Conversion to and from the
//! `records` types happens at this boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::records::*;
use crate::storage_traits::*;

const NAMESPACE: &str = "stagegate";
const DATABASE: &str = "main";
const DEFAULT_LOCAL_PATH: &str = ".stagegate/db";

fn backend(err: surrealdb::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PipelineRow {
    #[serde(default, skip_serializing)]
    id: Option<surrealdb::sql::Thing>,
    pipeline_id: String,
    version: u64,
    body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactRow {
    #[serde(default, skip_serializing)]
    id: Option<surrealdb::sql::Thing>,
    artifact_id: String,
    pipeline_id: String,
    artifact_type: String,
    approval: String,
    content_hash: Option<String>,
    ordinal: u64,
    body: serde_json::Value,
}

/// Row shape shared by the append-only tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordRow {
    #[serde(default, skip_serializing)]
    id: Option<surrealdb::sql::Thing>,
    record_id: String,
    pipeline_id: String,
    ordinal: u64,
    body: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OrdinalRow {
    ordinal: u64,
}

fn decode<T: DeserializeOwned>(body: serde_json::Value) -> StorageResult<T> {
    Ok(serde_json::from_value(body)?)
}

/// SurrealDB-backed [`GateStore`].
#[derive(Clone)]
pub struct SurrealGateStore {
    db: Surreal<Any>,
}

impl SurrealGateStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `stagegate/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB endpoint (`mem://`, `surrealkv://path`, `ws://...`).
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!(url = %url, "SurrealGateStore connected");
        Ok(Self { db })
    }

    /// Create from environment variables.
    ///
    /// Uses `STAGEGATE_DB_URL` when set; otherwise falls back to local
    /// persistence in `.stagegate/db`.
    pub async fn from_env() -> crate::Result<Self> {
        if let Ok(url) = std::env::var("STAGEGATE_DB_URL") {
            return Self::connect(&url).await;
        }

        std::fs::create_dir_all(DEFAULT_LOCAL_PATH).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                DEFAULT_LOCAL_PATH, e
            ))
        })?;
        let url = format!("surrealkv://{}", DEFAULT_LOCAL_PATH);
        info!("STAGEGATE_DB_URL not set, using local persistence: {}", url);
        Self::connect(&url).await
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_pipeline_row(&self, pid: &str) -> StorageResult<Option<PipelineRow>> {
        let mut res = self
            .db
            .query("SELECT pipeline_id, version, body FROM pipelines WHERE pipeline_id = $pid")
            .bind(("pid", pid.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<PipelineRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_artifact_row(&self, artifact_id: &str) -> StorageResult<Option<ArtifactRow>> {
        let mut res = self
            .db
            .query(
                "SELECT artifact_id, pipeline_id, artifact_type, approval, content_hash, ordinal, body \
                 FROM artifacts WHERE artifact_id = $aid",
            )
            .bind(("aid", artifact_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<ArtifactRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next())
    }

    /// Next 1-based ordinal for `pipeline_id` in `table`.
    async fn next_ordinal(&self, table: &str, pid: &str) -> StorageResult<u64> {
        let sql = format!(
            "SELECT ordinal FROM {table} WHERE pipeline_id = $pid ORDER BY ordinal DESC LIMIT 1"
        );
        let mut res = self
            .db
            .query(sql)
            .bind(("pid", pid.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<OrdinalRow> = res.take(0).map_err(backend)?;
        Ok(rows.first().map(|r| r.ordinal + 1).unwrap_or(1))
    }

    async fn record_exists(&self, table: &str, record_id: &str) -> StorageResult<bool> {
        let sql = format!("SELECT ordinal FROM {table} WHERE record_id = $rid");
        let mut res = self
            .db
            .query(sql)
            .bind(("rid", record_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<OrdinalRow> = res.take(0).map_err(backend)?;
        Ok(!rows.is_empty())
    }

    async fn insert_record(
        &self,
        table: &'static str,
        record_id: &str,
        pid: &str,
        body: serde_json::Value,
    ) -> StorageResult<u64> {
        if self.record_exists(table, record_id).await? {
            return Err(StorageError::Duplicate {
                id: record_id.to_string(),
            });
        }
        let ordinal = self.next_ordinal(table, pid).await?;
        let row = RecordRow {
            id: None,
            record_id: record_id.to_string(),
            pipeline_id: pid.to_string(),
            ordinal,
            body,
        };

        debug!(table = %table, record_id = %record_id, ordinal, "inserting record");

        let _created: Option<RecordRow> = self
            .db
            .create(table)
            .content(row)
            .await
            .map_err(backend)?;
        Ok(ordinal)
    }

    async fn list_records<T: DeserializeOwned>(
        &self,
        table: &str,
        pid: &str,
        newest_only: bool,
    ) -> StorageResult<Vec<T>> {
        let sql = if newest_only {
            format!(
                "SELECT record_id, pipeline_id, ordinal, body FROM {table} \
                 WHERE pipeline_id = $pid ORDER BY ordinal DESC LIMIT 1"
            )
        } else {
            format!(
                "SELECT record_id, pipeline_id, ordinal, body FROM {table} \
                 WHERE pipeline_id = $pid ORDER BY ordinal ASC"
            )
        };
        let mut res = self
            .db
            .query(sql)
            .bind(("pid", pid.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<RecordRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(|r| decode(r.body)).collect()
    }
}

#[async_trait]
impl PipelineReader for SurrealGateStore {
    async fn get_pipeline(&self, pipeline_id: &PipelineId) -> StorageResult<Option<PipelineState>> {
        self.fetch_pipeline_row(pipeline_id.as_str())
            .await?
            .map(|row| decode(row.body))
            .transpose()
    }

    async fn list_pipelines(&self) -> StorageResult<Vec<PipelineState>> {
        let mut res = self
            .db
            .query("SELECT pipeline_id, version, body FROM pipelines ORDER BY pipeline_id ASC")
            .await
            .map_err(backend)?;
        let rows: Vec<PipelineRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(|r| decode(r.body)).collect()
    }
}

#[async_trait]
impl PipelineStore for SurrealGateStore {
    async fn create_pipeline(&self, state: &PipelineState) -> StorageResult<()> {
        let pid = state.pipeline_id.as_str();
        if self.fetch_pipeline_row(pid).await?.is_some() {
            return Err(StorageError::PipelineExists {
                pipeline_id: pid.to_string(),
            });
        }
        let row = PipelineRow {
            id: None,
            pipeline_id: pid.to_string(),
            version: state.version,
            body: serde_json::to_value(state)?,
        };

        debug!(pipeline_id = %pid, "creating pipeline");

        let _created: Option<PipelineRow> = self
            .db
            .create("pipelines")
            .content(row)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: &PipelineState,
    ) -> StorageResult<()> {
        let pid = next.pipeline_id.0.clone();
        let mut res = self
            .db
            .query(
                "UPDATE pipelines SET version = $next_version, body = $body \
                 WHERE pipeline_id = $pid AND version = $expected",
            )
            .bind(("next_version", next.version))
            .bind(("body", serde_json::to_value(next)?))
            .bind(("pid", pid.clone()))
            .bind(("expected", expected_version))
            .await
            .map_err(backend)?;
        let updated: Vec<PipelineRow> = res.take(0).map_err(backend)?;
        if !updated.is_empty() {
            return Ok(());
        }

        match self.fetch_pipeline_row(&pid).await? {
            None => Err(StorageError::PipelineNotFound { pipeline_id: pid }),
            Some(row) => Err(StorageError::VersionConflict {
                pipeline_id: pid,
                expected: expected_version,
                actual: row.version,
            }),
        }
    }
}

#[async_trait]
impl ArtifactStore for SurrealGateStore {
    async fn insert_artifact(&self, artifact: &Artifact) -> StorageResult<()> {
        if self.fetch_artifact_row(&artifact.artifact_id).await?.is_some() {
            return Err(StorageError::Duplicate {
                id: artifact.artifact_id.clone(),
            });
        }
        let pid = artifact.pipeline_id.as_str();
        let ordinal = self.next_ordinal("artifacts", pid).await?;
        let row = ArtifactRow {
            id: None,
            artifact_id: artifact.artifact_id.clone(),
            pipeline_id: pid.to_string(),
            artifact_type: artifact.artifact_type.as_str().to_string(),
            approval: if artifact.is_approved() { "approved" } else { "draft" }.to_string(),
            content_hash: artifact.content_hash.as_ref().map(|h| h.as_str().to_string()),
            ordinal,
            body: serde_json::to_value(artifact)?,
        };
        let _created: Option<ArtifactRow> = self
            .db
            .create("artifacts")
            .content(row)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_artifact(&self, artifact_id: &str) -> StorageResult<Option<Artifact>> {
        self.fetch_artifact_row(artifact_id)
            .await?
            .map(|row| decode(row.body))
            .transpose()
    }

    async fn replace_draft(&self, artifact: &Artifact) -> StorageResult<()> {
        let aid = artifact.artifact_id.clone();
        let mut res = self
            .db
            .query("UPDATE artifacts SET body = $body WHERE artifact_id = $aid AND approval = 'draft'")
            .bind(("body", serde_json::to_value(artifact)?))
            .bind(("aid", aid.clone()))
            .await
            .map_err(backend)?;
        let updated: Vec<ArtifactRow> = res.take(0).map_err(backend)?;
        if !updated.is_empty() {
            return Ok(());
        }
        match self.fetch_artifact_row(&aid).await? {
            None => Err(StorageError::ArtifactNotFound { artifact_id: aid }),
            Some(_) => Err(StorageError::ImmutableRecord { id: aid }),
        }
    }

    async fn approve_artifact(
        &self,
        artifact_id: &str,
        content_hash: &ContentDigest,
        approved_at: DateTime<Utc>,
    ) -> StorageResult<Artifact> {
        let row = self
            .fetch_artifact_row(artifact_id)
            .await?
            .ok_or_else(|| StorageError::ArtifactNotFound {
                artifact_id: artifact_id.to_string(),
            })?;
        let mut artifact: Artifact = decode(row.body)?;
        if artifact.is_approved() {
            return Err(StorageError::ImmutableRecord {
                id: artifact_id.to_string(),
            });
        }
        artifact.content_hash = Some(content_hash.clone());
        artifact.approval = ApprovalStatus::Approved;
        artifact.approved_at = Some(approved_at);

        let mut res = self
            .db
            .query(
                "UPDATE artifacts SET body = $body, approval = 'approved', content_hash = $hash \
                 WHERE artifact_id = $aid AND approval = 'draft'",
            )
            .bind(("body", serde_json::to_value(&artifact)?))
            .bind(("hash", content_hash.as_str().to_string()))
            .bind(("aid", artifact_id.to_string()))
            .await
            .map_err(backend)?;
        let updated: Vec<ArtifactRow> = res.take(0).map_err(backend)?;
        if updated.is_empty() {
            // Lost the race against a concurrent approval.
            return Err(StorageError::ImmutableRecord {
                id: artifact_id.to_string(),
            });
        }
        Ok(artifact)
    }

    async fn list_artifacts(
        &self,
        pipeline_id: &PipelineId,
        artifact_type: Option<ArtifactType>,
    ) -> StorageResult<Vec<Artifact>> {
        let pid = pipeline_id.0.clone();
        let mut res = match artifact_type {
            Some(t) => self
                .db
                .query(
                    "SELECT artifact_id, pipeline_id, artifact_type, approval, content_hash, ordinal, body \
                     FROM artifacts WHERE pipeline_id = $pid AND artifact_type = $kind ORDER BY ordinal ASC",
                )
                .bind(("pid", pid))
                .bind(("kind", t.as_str().to_string()))
                .await
                .map_err(backend)?,
            None => self
                .db
                .query(
                    "SELECT artifact_id, pipeline_id, artifact_type, approval, content_hash, ordinal, body \
                     FROM artifacts WHERE pipeline_id = $pid ORDER BY ordinal ASC",
                )
                .bind(("pid", pid))
                .await
                .map_err(backend)?,
        };
        let rows: Vec<ArtifactRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(|r| decode(r.body)).collect()
    }

    async fn find_by_hash(
        &self,
        pipeline_id: &PipelineId,
        content_hash: &ContentDigest,
    ) -> StorageResult<Option<Artifact>> {
        let mut res = self
            .db
            .query(
                "SELECT artifact_id, pipeline_id, artifact_type, approval, content_hash, ordinal, body \
                 FROM artifacts WHERE pipeline_id = $pid AND content_hash = $hash LIMIT 1",
            )
            .bind(("pid", pipeline_id.0.clone()))
            .bind(("hash", content_hash.as_str().to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<ArtifactRow> = res.take(0).map_err(backend)?;
        rows.into_iter().next().map(|r| decode(r.body)).transpose()
    }
}

#[async_trait]
impl VerificationStore for SurrealGateStore {
    async fn record_result(&self, result: &VerificationResult) -> StorageResult<()> {
        self.insert_record(
            "verification_results",
            &result.result_id,
            result.pipeline_id.as_str(),
            serde_json::to_value(result)?,
        )
        .await?;
        Ok(())
    }

    async fn latest_result(
        &self,
        pipeline_id: &PipelineId,
    ) -> StorageResult<Option<VerificationResult>> {
        let mut rows = self
            .list_records("verification_results", pipeline_id.as_str(), true)
            .await?;
        Ok(rows.pop())
    }

    async fn list_results(
        &self,
        pipeline_id: &PipelineId,
    ) -> StorageResult<Vec<VerificationResult>> {
        self.list_records("verification_results", pipeline_id.as_str(), false)
            .await
    }
}

#[async_trait]
impl DecisionStore for SurrealGateStore {
    async fn record_decision(&self, decision: &CompletionDecision) -> StorageResult<()> {
        self.insert_record(
            "decisions",
            &decision.decision_id,
            decision.pipeline_id.as_str(),
            serde_json::to_value(decision)?,
        )
        .await?;
        Ok(())
    }

    async fn latest_decision(
        &self,
        pipeline_id: &PipelineId,
    ) -> StorageResult<Option<CompletionDecision>> {
        let mut rows = self
            .list_records("decisions", pipeline_id.as_str(), true)
            .await?;
        Ok(rows.pop())
    }

    async fn list_decisions(
        &self,
        pipeline_id: &PipelineId,
    ) -> StorageResult<Vec<CompletionDecision>> {
        self.list_records("decisions", pipeline_id.as_str(), false)
            .await
    }
}

#[async_trait]
impl EventLog for SurrealGateStore {
    async fn append_event(
        &self,
        pipeline_id: &PipelineId,
        kind: &str,
        payload: serde_json::Value,
    ) -> StorageResult<PipelineEvent> {
        let pid = pipeline_id.as_str();
        let seq = self.next_ordinal("pipeline_events", pid).await?;
        let event = PipelineEvent {
            seq,
            pipeline_id: pipeline_id.clone(),
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        let row = RecordRow {
            id: None,
            record_id: format!("{pid}:{seq}"),
            pipeline_id: pid.to_string(),
            ordinal: seq,
            body: serde_json::to_value(&event)?,
        };
        // The (pipeline_id, ordinal) unique index rejects a racing append.
        let _created: Option<RecordRow> = self
            .db
            .create("pipeline_events")
            .content(row)
            .await
            .map_err(backend)?;
        Ok(event)
    }

    async fn events(&self, pipeline_id: &PipelineId) -> StorageResult<Vec<PipelineEvent>> {
        self.list_records("pipeline_events", pipeline_id.as_str(), false)
            .await
    }
}
