//! In-memory fakes for storage traits (testing only)
//!
//! `MemoryGateStore` satisfies every repository contract without any
//! external dependencies. One mutex guards all tables so each trait method
//! is atomic with respect to the others.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::records::*;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct Tables {
    pipelines: BTreeMap<String, PipelineState>,
    artifacts: Vec<Artifact>,
    results: HashMap<String, Vec<VerificationResult>>,
    decisions: HashMap<String, Vec<CompletionDecision>>,
    events: HashMap<String, Vec<PipelineEvent>>,
}

/// In-memory implementation of every Stagegate repository.
#[derive(Debug, Default)]
pub struct MemoryGateStore {
    tables: Mutex<Tables>,
}

impl MemoryGateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StorageResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Backend("memory store mutex poisoned".to_string()))
    }
}

#[async_trait]
impl PipelineReader for MemoryGateStore {
    async fn get_pipeline(&self, pipeline_id: &PipelineId) -> StorageResult<Option<PipelineState>> {
        Ok(self.tables()?.pipelines.get(pipeline_id.as_str()).cloned())
    }

    async fn list_pipelines(&self) -> StorageResult<Vec<PipelineState>> {
        Ok(self.tables()?.pipelines.values().cloned().collect())
    }
}

#[async_trait]
impl PipelineStore for MemoryGateStore {
    async fn create_pipeline(&self, state: &PipelineState) -> StorageResult<()> {
        let mut tables = self.tables()?;
        if tables.pipelines.contains_key(state.pipeline_id.as_str()) {
            return Err(StorageError::PipelineExists {
                pipeline_id: state.pipeline_id.0.clone(),
            });
        }
        tables
            .pipelines
            .insert(state.pipeline_id.0.clone(), state.clone());
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: &PipelineState,
    ) -> StorageResult<()> {
        let mut tables = self.tables()?;
        let current = tables
            .pipelines
            .get_mut(next.pipeline_id.as_str())
            .ok_or_else(|| StorageError::PipelineNotFound {
                pipeline_id: next.pipeline_id.0.clone(),
            })?;
        if current.version != expected_version {
            return Err(StorageError::VersionConflict {
                pipeline_id: next.pipeline_id.0.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }
        *current = next.clone();
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for MemoryGateStore {
    async fn insert_artifact(&self, artifact: &Artifact) -> StorageResult<()> {
        let mut tables = self.tables()?;
        if tables
            .artifacts
            .iter()
            .any(|a| a.artifact_id == artifact.artifact_id)
        {
            return Err(StorageError::Duplicate {
                id: artifact.artifact_id.clone(),
            });
        }
        tables.artifacts.push(artifact.clone());
        Ok(())
    }

    async fn get_artifact(&self, artifact_id: &str) -> StorageResult<Option<Artifact>> {
        Ok(self
            .tables()?
            .artifacts
            .iter()
            .find(|a| a.artifact_id == artifact_id)
            .cloned())
    }

    async fn replace_draft(&self, artifact: &Artifact) -> StorageResult<()> {
        let mut tables = self.tables()?;
        let stored = tables
            .artifacts
            .iter_mut()
            .find(|a| a.artifact_id == artifact.artifact_id)
            .ok_or_else(|| StorageError::ArtifactNotFound {
                artifact_id: artifact.artifact_id.clone(),
            })?;
        if stored.is_approved() {
            return Err(StorageError::ImmutableRecord {
                id: artifact.artifact_id.clone(),
            });
        }
        *stored = artifact.clone();
        Ok(())
    }

    async fn approve_artifact(
        &self,
        artifact_id: &str,
        content_hash: &ContentDigest,
        approved_at: DateTime<Utc>,
    ) -> StorageResult<Artifact> {
        let mut tables = self.tables()?;
        let stored = tables
            .artifacts
            .iter_mut()
            .find(|a| a.artifact_id == artifact_id)
            .ok_or_else(|| StorageError::ArtifactNotFound {
                artifact_id: artifact_id.to_string(),
            })?;
        if stored.is_approved() {
            return Err(StorageError::ImmutableRecord {
                id: artifact_id.to_string(),
            });
        }
        stored.content_hash = Some(content_hash.clone());
        stored.approval = ApprovalStatus::Approved;
        stored.approved_at = Some(approved_at);
        Ok(stored.clone())
    }

    async fn list_artifacts(
        &self,
        pipeline_id: &PipelineId,
        artifact_type: Option<ArtifactType>,
    ) -> StorageResult<Vec<Artifact>> {
        Ok(self
            .tables()?
            .artifacts
            .iter()
            .filter(|a| &a.pipeline_id == pipeline_id)
            .filter(|a| artifact_type.map(|t| a.artifact_type == t).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn find_by_hash(
        &self,
        pipeline_id: &PipelineId,
        content_hash: &ContentDigest,
    ) -> StorageResult<Option<Artifact>> {
        Ok(self
            .tables()?
            .artifacts
            .iter()
            .find(|a| &a.pipeline_id == pipeline_id && a.content_hash.as_ref() == Some(content_hash))
            .cloned())
    }
}

#[async_trait]
impl VerificationStore for MemoryGateStore {
    async fn record_result(&self, result: &VerificationResult) -> StorageResult<()> {
        let mut tables = self.tables()?;
        let results = tables.results.entry(result.pipeline_id.0.clone()).or_default();
        if results.iter().any(|r| r.result_id == result.result_id) {
            return Err(StorageError::Duplicate {
                id: result.result_id.clone(),
            });
        }
        results.push(result.clone());
        Ok(())
    }

    async fn latest_result(
        &self,
        pipeline_id: &PipelineId,
    ) -> StorageResult<Option<VerificationResult>> {
        Ok(self
            .tables()?
            .results
            .get(pipeline_id.as_str())
            .and_then(|r| r.last().cloned()))
    }

    async fn list_results(
        &self,
        pipeline_id: &PipelineId,
    ) -> StorageResult<Vec<VerificationResult>> {
        Ok(self
            .tables()?
            .results
            .get(pipeline_id.as_str())
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl DecisionStore for MemoryGateStore {
    async fn record_decision(&self, decision: &CompletionDecision) -> StorageResult<()> {
        let mut tables = self.tables()?;
        let decisions = tables
            .decisions
            .entry(decision.pipeline_id.0.clone())
            .or_default();
        if decisions.iter().any(|d| d.decision_id == decision.decision_id) {
            return Err(StorageError::Duplicate {
                id: decision.decision_id.clone(),
            });
        }
        decisions.push(decision.clone());
        Ok(())
    }

    async fn latest_decision(
        &self,
        pipeline_id: &PipelineId,
    ) -> StorageResult<Option<CompletionDecision>> {
        Ok(self
            .tables()?
            .decisions
            .get(pipeline_id.as_str())
            .and_then(|d| d.last().cloned()))
    }

    async fn list_decisions(
        &self,
        pipeline_id: &PipelineId,
    ) -> StorageResult<Vec<CompletionDecision>> {
        Ok(self
            .tables()?
            .decisions
            .get(pipeline_id.as_str())
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl EventLog for MemoryGateStore {
    async fn append_event(
        &self,
        pipeline_id: &PipelineId,
        kind: &str,
        payload: serde_json::Value,
    ) -> StorageResult<PipelineEvent> {
        let mut tables = self.tables()?;
        let log = tables.events.entry(pipeline_id.0.clone()).or_default();
        let event = PipelineEvent {
            seq: log.len() as u64 + 1,
            pipeline_id: pipeline_id.clone(),
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        log.push(event.clone());
        Ok(event)
    }

    async fn events(&self, pipeline_id: &PipelineId) -> StorageResult<Vec<PipelineEvent>> {
        Ok(self
            .tables()?
            .events
            .get(pipeline_id.as_str())
            .cloned()
            .unwrap_or_default())
    }
}
