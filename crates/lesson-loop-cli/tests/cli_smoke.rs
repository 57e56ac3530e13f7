#![allow(clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{json, Value};
use ulid::Ulid;

fn temp_path(name: &str, ext: &str) -> PathBuf {
    std::env::temp_dir().join(format!("lessons-cli-test-{name}-{}.{ext}", Ulid::new()))
}

fn lessons(store: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_lessons"));
    command.arg("--store").arg(store);
    for arg in args {
        command.arg(arg);
    }
    command
        .output()
        .unwrap_or_else(|err| panic!("failed to execute lessons {:?}: {err}", args))
}

fn stdout_of(output: &Output) -> String {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn write_trace(name: &str, value: &Value) -> PathBuf {
    let path = temp_path(name, "json");
    let body = serde_json::to_string_pretty(value)
        .unwrap_or_else(|err| panic!("failed to serialize trace: {err}"));
    fs::write(&path, body).unwrap_or_else(|err| panic!("failed to write trace file: {err}"));
    path
}

fn missing_weather_trace() -> Value {
    json!({
        "task": "plan a trip to Paris",
        "tool_calls": [
            {"tool": "search_flights", "step_index": 0},
            {"tool": "recommend_hotels", "step_index": 1}
        ],
        "final_answer": "Fly SkyHigh, stay at the Grand Hotel."
    })
}

#[test]
fn recording_the_same_mistake_twice_learns_a_constraint() {
    let store = temp_path("learn", "json");
    let trace = write_trace("learn-trace", &missing_weather_trace());
    let trace_arg = trace.to_string_lossy().into_owned();

    let first = stdout_of(&lessons(&store, &["record", "--trace", &trace_arg]));
    assert!(first.contains("run_id=1"));
    assert!(first.contains("new_constraints=0"));
    assert!(first.contains("missing_required_tool"));

    let second = stdout_of(&lessons(&store, &["record", "--trace", &trace_arg]));
    assert!(second.contains("run_id=2"));
    assert!(second.contains("new_constraints=1"));
    assert!(second.contains("learned: ALWAYS use the required tool mentioned"));

    let constraints = stdout_of(&lessons(&store, &["constraints", "--json"]));
    let parsed: Value = serde_json::from_str(&constraints)
        .unwrap_or_else(|err| panic!("constraints output is not JSON: {err}"));
    let list = parsed
        .as_array()
        .unwrap_or_else(|| panic!("constraints JSON is not an array"));
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["occurrences_at_creation"], 2);
    assert_eq!(list[0]["active"], true);
}

#[test]
fn invalid_trace_fails_without_touching_the_store() {
    let store = temp_path("invalid", "json");
    let trace = write_trace(
        "invalid-trace",
        &json!({
            "task": "plan",
            "tool_calls": [{"tool": "book_cruise", "step_index": 0}],
            "final_answer": ""
        }),
    );
    let trace_arg = trace.to_string_lossy().into_owned();

    let output = lessons(&store, &["record", "--trace", &trace_arg]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown tool"));
    assert!(!store.exists());
}

#[test]
fn demo_converges_and_reports_learned_constraints() {
    let store = temp_path("demo", "json");

    let output = stdout_of(&lessons(&store, &["demo", "--runs", "8"]));
    assert!(output.contains("--- run 1/8 (constraints injected: 0) ---"));
    assert!(output.contains("learned:"));
    assert!(output.contains("--- summary:"));

    let stats = stdout_of(&lessons(&store, &["stats", "--json"]));
    let parsed: Value = serde_json::from_str(&stats)
        .unwrap_or_else(|err| panic!("stats output is not JSON: {err}"));
    assert_eq!(parsed["total_runs"], 8);
    // Missing-weather, premature-answer, and wrong-sequence each recurred.
    assert_eq!(parsed["learned_constraints"], 3);

    let history = stdout_of(&lessons(&store, &["history", "--limit", "2"]));
    assert_eq!(history.lines().count(), 2);
}

#[test]
fn corrupt_store_warns_and_starts_empty() {
    let store = temp_path("corrupt", "json");
    fs::write(&store, "{ not json")
        .unwrap_or_else(|err| panic!("failed to seed corrupt store: {err}"));

    let output = lessons(&store, &["stats"]);
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("warning:"));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("total_runs=0"));
}
