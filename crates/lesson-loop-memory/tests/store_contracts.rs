#![allow(clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use lesson_loop_domain::{
    now_utc, Constraint, ExecutionTrace, MistakeFinding, MistakeKind, PatternKey, RunId,
};
use lesson_loop_memory::{JsonFileStore, PatternMemory, DEFAULT_THRESHOLD};
use serde_json::Value;
use ulid::Ulid;

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("lesson-loop-contract-{name}-{}.json", Ulid::new()))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn schema_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../docs/schemas/lesson_store.v1.schema.json")
}

fn assert_schema(value: &Value) {
    let schema = read_json(&schema_path());
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile store schema: {err}"));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!("store document violates schema:\n{}", errors.join("\n"));
    }
}

fn missing_weather() -> MistakeFinding {
    MistakeFinding {
        kind: MistakeKind::MissingRequiredTool,
        detail: "required tool 'check_weather' was not used".to_string(),
        step_index: None,
    }
}

fn populated_store(name: &str) -> PathBuf {
    let path = temp_path(name);
    let (mut memory, warning) = PatternMemory::open(JsonFileStore::new(&path), DEFAULT_THRESHOLD)
        .unwrap_or_else(|err| panic!("failed to open store: {err}"));
    assert!(warning.is_none());

    let trace = ExecutionTrace::new("plan a trip to Paris")
        .with_tool_calls(&["search_flights", "recommend_hotels"])
        .with_final_answer("Fly SkyHigh, stay at the Grand Hotel.");

    let findings = vec![missing_weather()];
    let _ = memory
        .record_run(RunId(1), &trace, &findings)
        .unwrap_or_else(|err| panic!("first record failed: {err}"));

    // Second occurrence crosses the threshold; attach the constraint the
    // synthesizer would produce in the same staged write.
    let mut staged = memory.stage_run(RunId(2), &trace, &findings);
    assert_eq!(staged.crossed_keys.len(), 1);
    let key = PatternKey::from_finding(&missing_weather());
    staged.document.constraints.push(Constraint {
        id: Ulid::new(),
        source_pattern_key: key,
        text: "ALWAYS use the required tool mentioned: required tool 'check_weather' \
               was not used (learned from 2 past mistakes)"
            .to_string(),
        occurrences_at_creation: 2,
        created_at_run_id: RunId(2),
        created_at: now_utc(),
        active: true,
    });
    memory
        .commit(staged.document)
        .unwrap_or_else(|err| panic!("commit failed: {err}"));

    path
}

#[test]
fn persisted_document_matches_v1_schema() {
    let path = populated_store("schema");
    let document = read_json(&path);
    assert_schema(&document);
}

#[test]
fn persisted_document_round_trips_through_reload() {
    let path = populated_store("roundtrip");
    let on_disk = read_json(&path);

    let (memory, warning) = PatternMemory::open(JsonFileStore::new(&path), DEFAULT_THRESHOLD)
        .unwrap_or_else(|err| panic!("failed to reopen store: {err}"));
    assert!(warning.is_none());

    let reserialized = serde_json::to_value(memory.document())
        .unwrap_or_else(|err| panic!("failed to serialize document: {err}"));
    assert_eq!(on_disk, reserialized);
}

#[test]
fn empty_document_matches_v1_schema() {
    let path = temp_path("empty");
    let (mut memory, _) = PatternMemory::open(JsonFileStore::new(&path), DEFAULT_THRESHOLD)
        .unwrap_or_else(|err| panic!("failed to open store: {err}"));
    let staged = memory.stage_run(RunId(1), &ExecutionTrace::new("plan"), &[]);
    memory
        .commit(staged.document)
        .unwrap_or_else(|err| panic!("commit failed: {err}"));

    assert_schema(&read_json(&path));
}
