//! SurrealDB schema migrations and initialization
//!
//! Sets up every Stagegate table with the indexes the store relies on for
//! uniqueness and ordering.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Stagegate tables in SurrealDB.
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Stagegate SurrealDB schema");

    init_pipelines_table(db).await?;
    init_artifacts_table(db).await?;
    init_record_table(db, "verification_results").await?;
    init_record_table(db, "decisions").await?;
    init_record_table(db, "pipeline_events").await?;

    info!("Stagegate schema initialization complete");
    Ok(())
}

/// Initialize `pipelines` table
///
/// Schema:
/// ```text
/// TABLE pipelines {
///   pipeline_id:  STRING (unique)
///   version:      INT    (compare-and-swap revision)
///   body:         OBJECT (serialized PipelineState)
/// }
/// ```
async fn init_pipelines_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing pipelines table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS pipelines AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_pipeline_id ON TABLE pipelines COLUMNS pipeline_id UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// Initialize `artifacts` table
///
/// Schema:
/// ```text
/// TABLE artifacts {
///   artifact_id:    STRING (unique)
///   pipeline_id:    STRING (indexed)
///   artifact_type:  STRING
///   approval:       STRING (draft | approved)
///   content_hash:   STRING? (set once, on approval)
///   ordinal:        INT    (insertion order within the pipeline)
///   body:           OBJECT (serialized Artifact)
/// }
/// ```
///
/// Approved rows are never rewritten; enforced by the `approval = 'draft'`
/// guard on every UPDATE issued by the store.
async fn init_artifacts_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing artifacts table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS artifacts AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_artifact_id ON TABLE artifacts COLUMNS artifact_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_artifact_pipeline ON TABLE artifacts COLUMNS pipeline_id, ordinal;
        DEFINE INDEX IF NOT EXISTS idx_artifact_hash ON TABLE artifacts COLUMNS pipeline_id, content_hash;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// Initialize an append-only record table (results, decisions, events).
///
/// Schema:
/// ```text
/// TABLE <name> {
///   record_id:    STRING (unique)
///   pipeline_id:  STRING
///   ordinal:      INT    (unique per pipeline, 1-based)
///   body:         OBJECT
/// }
/// ```
async fn init_record_table(db: &Surreal<Any>, table: &str) -> Result<()> {
    debug!(table = %table, "Initializing append-only table");

    let sql = format!(
        r#"
        DEFINE TABLE IF NOT EXISTS {table} AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_{table}_record_id ON TABLE {table} COLUMNS record_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_{table}_ordinal ON TABLE {table} COLUMNS pipeline_id, ordinal UNIQUE;
    "#
    );

    db.query(sql).await?.check()?;
    Ok(())
}
