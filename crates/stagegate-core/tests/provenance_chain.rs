//! Provenance hashing properties over realistic artifact payloads.

use serde_json::json;
use stagegate_core::{canonical_json, ProvenanceHasher};
use stagegate_state::{ArtifactType, ContentDigest};

fn build_plan() -> serde_json::Value {
    json!({
        "execution_units": ["scaffold", "screens", "api"],
        "file_tree": {"src": ["index.ts", "App.tsx"]},
        "dependencies": {"react": "18.2.0"},
    })
}

#[test]
fn reordered_and_decorated_payloads_hash_alike() {
    let h = ProvenanceHasher::new();
    let upstream = [ContentDigest::from_bytes(b"requirements")];
    let a = h
        .hash(ArtifactType::BuildPlan, &build_plan(), &upstream)
        .expect("hash");

    let reordered = json!({
        "dependencies": {"react": "18.2.0"},
        "notes_for_reviewer": "ignore me",
        "file_tree": {"src": ["index.ts", "App.tsx"]},
        "execution_units": ["scaffold", "screens", "api"],
        "generated_at": "2026-01-01T00:00:00Z",
    });
    let b = h
        .hash(ArtifactType::BuildPlan, &reordered, &upstream)
        .expect("hash");
    assert_eq!(a, b);
}

#[test]
fn nested_and_array_order_changes_are_seen() {
    let h = ProvenanceHasher::new();
    let a = h.hash(ArtifactType::BuildPlan, &build_plan(), &[]).expect("hash");

    let mut swapped = build_plan();
    swapped["execution_units"] = json!(["screens", "scaffold", "api"]);
    assert_ne!(a, h.hash(ArtifactType::BuildPlan, &swapped, &[]).expect("hash"));

    let mut bumped = build_plan();
    bumped["dependencies"]["react"] = json!("18.3.0");
    assert_ne!(a, h.hash(ArtifactType::BuildPlan, &bumped, &[]).expect("hash"));
}

#[test]
fn identical_content_with_different_lineage_differs() {
    let h = ProvenanceHasher::new();
    let req_v1 = ContentDigest::from_bytes(b"requirements-v1");
    let req_v2 = ContentDigest::from_bytes(b"requirements-v2");
    let screens = ContentDigest::from_bytes(b"screens");

    let a = h
        .hash(ArtifactType::BuildPlan, &build_plan(), &[req_v1.clone(), screens.clone()])
        .expect("hash");
    let b = h
        .hash(ArtifactType::BuildPlan, &build_plan(), &[req_v2, screens.clone()])
        .expect("hash");
    let c = h
        .hash(ArtifactType::BuildPlan, &build_plan(), &[screens, req_v1])
        .expect("hash");
    assert_ne!(a, b);
    assert_ne!(a, c);
}

#[test]
fn same_payload_different_type_differs() {
    let h = ProvenanceHasher::new();
    let payload = json!({});
    let a = h.hash(ArtifactType::Requirements, &payload, &[]).expect("hash");
    let b = h.hash(ArtifactType::Manifest, &payload, &[]).expect("hash");
    assert_ne!(a, b);
}

#[test]
fn integral_floats_canonicalize_like_integers() {
    let a = canonical_json(&json!({"n": 1.0, "m": [2.0]})).expect("canonical");
    let b = canonical_json(&json!({"m": [2], "n": 1})).expect("canonical");
    assert_eq!(a, b);
}
