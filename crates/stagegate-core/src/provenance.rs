//! Provenance hashing: deterministic, allowlisted content hashes that chain
//! every approved artifact to its approved inputs.
//!
//! Only allowlisted fields of a payload are hashed, so presentation-only
//! keys and key order never change a hash. Each allowlist is versioned and
//! the version is part of the hashed document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use stagegate_state::{
    Artifact, ArtifactType, ContentDigest, PipelineId, StepStatus, VerificationStep,
};

use crate::digest::compute_digest;
use crate::error::{GateError, IntegrityViolation, Result};

/// Versioned field allowlist for one artifact type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalSchema {
    pub artifact_type: ArtifactType,
    pub schema_version: u32,
    /// Sorted, deduplicated top-level payload keys.
    pub fields: Vec<String>,
}

impl CanonicalSchema {
    pub fn new(artifact_type: ArtifactType, schema_version: u32, fields: &[&str]) -> Self {
        let mut fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        fields.sort();
        fields.dedup();
        Self {
            artifact_type,
            schema_version,
            fields,
        }
    }

    /// Built-in allowlist for `artifact_type`.
    pub fn builtin(artifact_type: ArtifactType) -> Self {
        match artifact_type {
            ArtifactType::Requirements => Self::new(
                artifact_type,
                1,
                &["acceptance_criteria", "constraints", "features", "summary", "title"],
            ),
            ArtifactType::ScreenSpec => {
                Self::new(artifact_type, 1, &["components", "navigation", "screens"])
            }
            ArtifactType::BuildPlan => Self::new(
                artifact_type,
                1,
                &["dependencies", "execution_units", "file_tree"],
            ),
            ArtifactType::Manifest => {
                Self::new(artifact_type, 1, &["entrypoint", "files", "run_command"])
            }
        }
    }
}

/// Approved artifact types an artifact must be produced from.
pub fn required_upstream(artifact_type: ArtifactType) -> &'static [ArtifactType] {
    match artifact_type {
        ArtifactType::Requirements => &[],
        ArtifactType::ScreenSpec => &[ArtifactType::Requirements],
        ArtifactType::BuildPlan => &[ArtifactType::Requirements, ArtifactType::ScreenSpec],
        ArtifactType::Manifest => &[ArtifactType::BuildPlan],
    }
}

/// Pure hasher over the per-type allowlists. No I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceHasher {
    schemas: BTreeMap<ArtifactType, CanonicalSchema>,
}

impl Default for ProvenanceHasher {
    fn default() -> Self {
        Self {
            schemas: ArtifactType::ALL
                .into_iter()
                .map(|t| (t, CanonicalSchema::builtin(t)))
                .collect(),
        }
    }
}

impl ProvenanceHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the allowlist for one type.
    pub fn with_schema(mut self, schema: CanonicalSchema) -> Self {
        self.schemas.insert(schema.artifact_type, schema);
        self
    }

    pub fn schema(&self, artifact_type: ArtifactType) -> CanonicalSchema {
        self.schemas
            .get(&artifact_type)
            .cloned()
            .unwrap_or_else(|| CanonicalSchema::builtin(artifact_type))
    }

    /// The document that gets hashed: type, schema version, allowlisted
    /// fields (absent ones as `null`) and the ordered upstream hashes.
    pub fn canonical_document(
        &self,
        artifact_type: ArtifactType,
        payload: &Value,
        upstream_hashes: &[ContentDigest],
    ) -> Result<Value> {
        let object = payload.as_object().ok_or_else(|| {
            GateError::InvalidPayload(format!("{artifact_type} payload must be a JSON object"))
        })?;
        let schema = self.schema(artifact_type);

        let fields: Map<String, Value> = schema
            .fields
            .iter()
            .map(|f| (f.clone(), object.get(f).cloned().unwrap_or(Value::Null)))
            .collect();
        let upstream: Vec<&str> = upstream_hashes.iter().map(ContentDigest::as_str).collect();

        Ok(json!({
            "artifact_type": artifact_type.as_str(),
            "schema_version": schema.schema_version,
            "fields": fields,
            "upstream": upstream,
        }))
    }

    pub fn hash(
        &self,
        artifact_type: ArtifactType,
        payload: &Value,
        upstream_hashes: &[ContentDigest],
    ) -> Result<ContentDigest> {
        compute_digest(&self.canonical_document(artifact_type, payload, upstream_hashes)?)
    }

    /// Recompute an artifact's hash and compare with the stored one.
    pub fn verify(&self, artifact: &Artifact) -> Result<ContentDigest> {
        let expected =
            artifact
                .content_hash
                .as_ref()
                .ok_or_else(|| IntegrityViolation::MissingHash {
                    artifact_id: artifact.artifact_id.clone(),
                })?;
        let actual = self.hash(
            artifact.artifact_type,
            &artifact.payload,
            &artifact.upstream_hashes,
        )?;
        if &actual != expected {
            return Err(IntegrityViolation::HashMismatch {
                artifact_id: artifact.artifact_id.clone(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        Ok(actual)
    }

    /// `result_hash` of a verification attempt. Ids and timestamps are not
    /// part of it.
    pub fn hash_verification(
        &self,
        pipeline_id: &PipelineId,
        attempt: u32,
        overall_status: StepStatus,
        steps: &[VerificationStep],
    ) -> Result<ContentDigest> {
        let steps: Vec<Value> = steps
            .iter()
            .map(|s| {
                json!({
                    "index": s.index,
                    "command": s.command,
                    "exit_code": s.exit_code,
                    "stdout": s.stdout,
                    "stderr": s.stderr,
                    "status": s.status.as_str(),
                })
            })
            .collect();
        compute_digest(&json!({
            "pipeline_id": pipeline_id.as_str(),
            "attempt": attempt,
            "overall_status": overall_status.as_str(),
            "steps": steps,
        }))
    }
}
