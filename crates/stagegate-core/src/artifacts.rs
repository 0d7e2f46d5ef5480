//! Artifact registry: drafts, approval with hash-lock, supersession and
//! re-verification.
//!
//! An artifact is hashed before it is approved and the hash is persisted in
//! the same write that flips it to `approved`. From then on the record is
//! frozen; changes go through [`ArtifactRegistry::supersede`].

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use stagegate_state::{
    Artifact, ArtifactStore, ArtifactType, ContentDigest, EventLog, PipelineId, StorageError,
};

use crate::conductor::Conductor;
use crate::error::{GateError, IntegrityViolation, Result};
use crate::obs;
use crate::provenance::{required_upstream, ProvenanceHasher};

#[derive(Clone)]
pub struct ArtifactRegistry {
    artifacts: Arc<dyn ArtifactStore>,
    events: Arc<dyn EventLog>,
    conductor: Conductor,
    hasher: ProvenanceHasher,
}

impl ArtifactRegistry {
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        events: Arc<dyn EventLog>,
        conductor: Conductor,
    ) -> Self {
        Self {
            artifacts,
            events,
            conductor,
            hasher: ProvenanceHasher::default(),
        }
    }

    pub fn with_hasher(mut self, hasher: ProvenanceHasher) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn hasher(&self) -> &ProvenanceHasher {
        &self.hasher
    }

    async fn load(&self, artifact_id: &str) -> Result<Artifact> {
        self.artifacts
            .get_artifact(artifact_id)
            .await?
            .ok_or_else(|| {
                StorageError::ArtifactNotFound {
                    artifact_id: artifact_id.to_string(),
                }
                .into()
            })
    }

    fn ensure_object(artifact_type: ArtifactType, payload: &Value) -> Result<()> {
        if payload.is_object() {
            Ok(())
        } else {
            Err(GateError::InvalidPayload(format!(
                "{artifact_type} payload must be a JSON object"
            )))
        }
    }

    /// Every upstream must be an approved artifact of this pipeline of a type
    /// `artifact_type` is produced from, and every required type must be
    /// covered.
    async fn check_upstream(
        &self,
        pipeline_id: &PipelineId,
        artifact_type: ArtifactType,
        upstream: &[ContentDigest],
    ) -> Result<()> {
        let required = required_upstream(artifact_type);
        let mut covered = Vec::with_capacity(upstream.len());

        for hash in upstream {
            let found = self
                .artifacts
                .find_by_hash(pipeline_id, hash)
                .await?
                .filter(Artifact::is_approved)
                .ok_or_else(|| IntegrityViolation::UnapprovedUpstream {
                    hash: hash.to_string(),
                })?;
            if !required.contains(&found.artifact_type) {
                return Err(IntegrityViolation::ForeignUpstream {
                    hash: hash.to_string(),
                    found: found.artifact_type.to_string(),
                    artifact_type: artifact_type.to_string(),
                }
                .into());
            }
            covered.push(found.artifact_type);
        }

        if let Some(missing) = required.iter().find(|t| !covered.contains(t)) {
            return Err(IntegrityViolation::MissingUpstream {
                artifact_type: artifact_type.to_string(),
                required: missing.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Create an unhashed draft.
    pub async fn submit(
        &self,
        pipeline_id: &PipelineId,
        artifact_type: ArtifactType,
        stage: &str,
        payload: Value,
        upstream: Vec<ContentDigest>,
    ) -> Result<Artifact> {
        self.conductor.state(pipeline_id).await?;
        Self::ensure_object(artifact_type, &payload)?;
        self.check_upstream(pipeline_id, artifact_type, &upstream)
            .await?;

        let artifact = Artifact::draft(pipeline_id.clone(), artifact_type, stage, payload, upstream);
        self.artifacts.insert_artifact(&artifact).await?;
        self.events
            .append_event(
                pipeline_id,
                "artifact.submitted",
                json!({
                    "artifact_id": artifact.artifact_id,
                    "artifact_type": artifact_type.as_str(),
                    "version": artifact.version,
                    "stage": stage,
                }),
            )
            .await?;
        Ok(artifact)
    }

    /// Replace the payload of a draft.
    pub async fn revise(&self, artifact_id: &str, payload: Value) -> Result<Artifact> {
        let mut artifact = self.load(artifact_id).await?;
        if artifact.is_approved() {
            return Err(IntegrityViolation::LockedArtifact {
                artifact_id: artifact_id.to_string(),
            }
            .into());
        }
        Self::ensure_object(artifact.artifact_type, &payload)?;
        artifact.payload = payload;
        self.artifacts.replace_draft(&artifact).await?;
        Ok(artifact)
    }

    /// Hash a draft and approve it in one write.
    pub async fn approve(&self, artifact_id: &str) -> Result<Artifact> {
        let draft = self.load(artifact_id).await?;
        if draft.is_approved() {
            return Err(IntegrityViolation::LockedArtifact {
                artifact_id: artifact_id.to_string(),
            }
            .into());
        }
        let hash = self
            .hasher
            .hash(draft.artifact_type, &draft.payload, &draft.upstream_hashes)?;

        let approved = self
            .artifacts
            .approve_artifact(artifact_id, &hash, Utc::now())
            .await?;
        self.events
            .append_event(
                &approved.pipeline_id,
                "artifact.approved",
                json!({
                    "artifact_id": approved.artifact_id,
                    "artifact_type": approved.artifact_type.as_str(),
                    "version": approved.version,
                    "content_hash": hash.as_str(),
                    "upstream": approved.upstream_hashes,
                }),
            )
            .await?;
        obs::emit_artifact_approved(
            approved.pipeline_id.as_str(),
            &approved.artifact_id,
            approved.artifact_type.as_str(),
            hash.as_str(),
        );
        Ok(approved)
    }

    /// Start the next version of an artifact as a new draft with the same
    /// upstream chain.
    pub async fn supersede(&self, artifact_id: &str, payload: Value) -> Result<Artifact> {
        let previous = self.load(artifact_id).await?;
        Self::ensure_object(previous.artifact_type, &payload)?;

        let mut next = Artifact::draft(
            previous.pipeline_id.clone(),
            previous.artifact_type,
            previous.producing_stage.clone(),
            payload,
            previous.upstream_hashes.clone(),
        );
        next.version = previous.version + 1;
        next.supersedes = Some(previous.artifact_id.clone());
        self.artifacts.insert_artifact(&next).await?;
        self.events
            .append_event(
                &next.pipeline_id,
                "artifact.superseded",
                json!({
                    "artifact_id": next.artifact_id,
                    "supersedes": previous.artifact_id,
                    "version": next.version,
                }),
            )
            .await?;
        Ok(next)
    }

    /// Re-hash an approved artifact. A mismatch halts its pipeline before
    /// the error is returned.
    pub async fn verify(&self, artifact_id: &str) -> Result<ContentDigest> {
        let artifact = self.load(artifact_id).await?;
        match self.hasher.verify(&artifact) {
            Ok(hash) => Ok(hash),
            Err(err @ GateError::IntegrityViolation(IntegrityViolation::HashMismatch { .. })) => {
                self.conductor
                    .halt(
                        &artifact.pipeline_id,
                        &format!("integrity violation: {err}"),
                    )
                    .await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get(&self, artifact_id: &str) -> Result<Artifact> {
        self.load(artifact_id).await
    }

    /// Highest version of `artifact_type` for the pipeline, approved or not.
    pub async fn latest(
        &self,
        pipeline_id: &PipelineId,
        artifact_type: ArtifactType,
    ) -> Result<Option<Artifact>> {
        Ok(self
            .artifacts
            .list_artifacts(pipeline_id, Some(artifact_type))
            .await?
            .into_iter()
            .max_by_key(|a| a.version))
    }

    pub async fn list(&self, pipeline_id: &PipelineId) -> Result<Vec<Artifact>> {
        Ok(self.artifacts.list_artifacts(pipeline_id, None).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provenance::CanonicalSchema;
    use stagegate_state::fakes::MemoryGateStore;
    use stagegate_state::HumanGate;

    async fn registry() -> (ArtifactRegistry, Arc<MemoryGateStore>, PipelineId) {
        let store = Arc::new(MemoryGateStore::new());
        let conductor = Conductor::new(store.clone(), store.clone());
        let pid = PipelineId::from("p");
        conductor.initialize(&pid).await.expect("init");
        (
            ArtifactRegistry::new(store.clone(), store.clone(), conductor),
            store,
            pid,
        )
    }

    async fn approved_requirements(reg: &ArtifactRegistry, pid: &PipelineId) -> Artifact {
        let draft = reg
            .submit(
                pid,
                ArtifactType::Requirements,
                "documenting",
                json!({"title": "Todo", "features": ["add"]}),
                vec![],
            )
            .await
            .expect("submit");
        reg.approve(&draft.artifact_id).await.expect("approve")
    }

    #[tokio::test]
    async fn test_submit_requires_pipeline() {
        let (reg, _, _) = registry().await;
        let err = reg
            .submit(
                &PipelineId::from("ghost"),
                ArtifactType::Requirements,
                "documenting",
                json!({}),
                vec![],
            )
            .await
            .unwrap_err();
        assert!(err.state_violation().is_some());
    }

    #[tokio::test]
    async fn test_approve_hash_locks() {
        let (reg, _, pid) = registry().await;
        let approved = approved_requirements(&reg, &pid).await;
        assert!(approved.is_approved());
        let hash = approved.content_hash.clone().expect("hash");
        assert_eq!(reg.verify(&approved.artifact_id).await.expect("verify"), hash);

        let err = reg
            .revise(&approved.artifact_id, json!({"title": "Changed"}))
            .await
            .unwrap_err();
        assert!(matches!(
            err.integrity_violation(),
            Some(IntegrityViolation::LockedArtifact { .. })
        ));
        let err = reg.approve(&approved.artifact_id).await.unwrap_err();
        assert!(matches!(
            err.integrity_violation(),
            Some(IntegrityViolation::LockedArtifact { .. })
        ));
    }

    #[tokio::test]
    async fn test_upstream_must_be_approved_and_required() {
        let (reg, _, pid) = registry().await;
        let err = reg
            .submit(
                &pid,
                ArtifactType::ScreenSpec,
                "screen_design",
                json!({"screens": []}),
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.integrity_violation(),
            Some(IntegrityViolation::MissingUpstream { .. })
        ));

        let err = reg
            .submit(
                &pid,
                ArtifactType::ScreenSpec,
                "screen_design",
                json!({"screens": []}),
                vec![ContentDigest::from_bytes(b"nope")],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.integrity_violation(),
            Some(IntegrityViolation::UnapprovedUpstream { .. })
        ));

        let req = approved_requirements(&reg, &pid).await;
        let req_hash = req.content_hash.expect("hash");
        let err = reg
            .submit(
                &pid,
                ArtifactType::Manifest,
                "planning",
                json!({"entrypoint": "index.js"}),
                vec![req_hash.clone()],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.integrity_violation(),
            Some(IntegrityViolation::ForeignUpstream { .. })
        ));

        reg.submit(
            &pid,
            ArtifactType::ScreenSpec,
            "screen_design",
            json!({"screens": ["home"]}),
            vec![req_hash],
        )
        .await
        .expect("screen spec with approved requirements");
    }

    #[tokio::test]
    async fn test_supersede_creates_next_draft() {
        let (reg, _, pid) = registry().await;
        let v1 = approved_requirements(&reg, &pid).await;
        let v2 = reg
            .supersede(&v1.artifact_id, json!({"title": "Todo v2"}))
            .await
            .expect("supersede");
        assert_eq!(v2.version, 2);
        assert_eq!(v2.supersedes.as_deref(), Some(v1.artifact_id.as_str()));
        assert!(!v2.is_approved());

        let latest = reg
            .latest(&pid, ArtifactType::Requirements)
            .await
            .expect("latest")
            .expect("some");
        assert_eq!(latest.artifact_id, v2.artifact_id);
    }

    #[tokio::test]
    async fn test_hash_mismatch_halts_pipeline() {
        let (reg, store, pid) = registry().await;
        let approved = approved_requirements(&reg, &pid).await;

        // Same store, different allowlist: the stored hash no longer matches.
        let drifted = reg.clone().with_hasher(ProvenanceHasher::new().with_schema(
            CanonicalSchema::new(ArtifactType::Requirements, 2, &["title"]),
        ));
        let err = drifted.verify(&approved.artifact_id).await.unwrap_err();
        assert!(matches!(
            err.integrity_violation(),
            Some(IntegrityViolation::HashMismatch { .. })
        ));

        let state = reg.conductor.state(&pid).await.expect("state");
        assert!(matches!(state.gate, HumanGate::Halted { .. }));
        let events = store.events(&pid).await.expect("events");
        assert!(events.iter().any(|e| e.kind == "pipeline.halted"));
    }

    #[tokio::test]
    async fn test_verify_draft_does_not_halt() {
        let (reg, _, pid) = registry().await;
        let draft = reg
            .submit(
                &pid,
                ArtifactType::Requirements,
                "documenting",
                json!({"title": "x"}),
                vec![],
            )
            .await
            .expect("submit");
        let err = reg.verify(&draft.artifact_id).await.unwrap_err();
        assert!(matches!(
            err.integrity_violation(),
            Some(IntegrityViolation::MissingHash { .. })
        ));
        let state = reg.conductor.state(&pid).await.expect("state");
        assert!(state.gate.is_open());
    }
}
