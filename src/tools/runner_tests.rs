// src/tools/runner_tests.rs
// Tests for tool dispatch, validation-first ordering, and memoization

use super::*;
use crate::config::{DockerConfig, FileStoreConfig};
use crate::llm::{FunctionCall, Tool, ToolCall};
use crate::memory::rotation::IndexRotation;
use std::sync::atomic::{AtomicUsize, Ordering};

async fn make_runner(dir: &std::path::Path) -> ToolRunner {
    let store = Arc::new(
        FileStore::open(dir.to_path_buf(), FileStoreConfig::default())
            .await
            .unwrap(),
    );
    let rotation = IndexRotation::new(dir.join("memory/.index"), "memory".to_string(), 50.0);
    let indexer = Arc::new(MemoryIndexer::new(rotation, 400, 80, true, None));
    let sandbox = Arc::new(DockerSandbox::new(DockerConfig::default()));
    ToolRunner::new(
        store,
        indexer,
        sandbox,
        vec!["ls".to_string(), "echo".to_string()],
        SearchOptions {
            min_score: 0.0,
            ..Default::default()
        },
    )
}

fn call(name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall {
        id: format!("call_{}", name),
        call_type: "function".to_string(),
        function: FunctionCall {
            name: name.to_string(),
            arguments: args.to_string(),
        },
    }
}

#[tokio::test]
async fn test_unknown_tool_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let runner = make_runner(dir.path()).await;

    let result = runner
        .execute_call(&call("no_such_tool", serde_json::json!({})), "s1")
        .await;
    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("bad_input"));
}

#[tokio::test]
async fn test_malformed_arguments_fail_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let runner = make_runner(dir.path()).await;

    let mut bad = call("memory_search", serde_json::json!({}));
    bad.function.arguments = "{not json".to_string();
    let result = runner.execute_call(&bad, "s1").await;
    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("bad_input"));
}

#[tokio::test]
async fn test_command_not_whitelisted_fails_before_sandbox() {
    let dir = tempfile::tempdir().unwrap();
    let runner = make_runner(dir.path()).await;

    let result = runner
        .execute_call(
            &call("execute_command", serde_json::json!({"command": "rm -rf /"})),
            "s1",
        )
        .await;
    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("not_permitted"));
    assert!(result.observation.contains("rm"));
}

#[tokio::test]
async fn test_python_denied_import_fails_before_sandbox() {
    let dir = tempfile::tempdir().unwrap();
    let runner = make_runner(dir.path()).await;

    let result = runner
        .execute_call(
            &call("run_python", serde_json::json!({"code": "import subprocess\n"})),
            "s1",
        )
        .await;
    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("not_permitted"));
}

#[tokio::test]
async fn test_memory_search_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let runner = make_runner(dir.path()).await;

    let memory_dir = dir.path().join("memory");
    std::fs::create_dir_all(&memory_dir).unwrap();
    let file = memory_dir.join("facts.md");
    std::fs::write(&file, "Python decorator examples\n").unwrap();
    runner.indexer.index_file(&file).await.unwrap();

    let result = runner
        .execute_call(
            &call("memory_search", serde_json::json!({"query": "decorator"})),
            "s1",
        )
        .await;
    assert!(result.success, "{}", result.observation);
    assert!(result.observation.contains("Search results"));
    assert!(result.observation.contains("facts.md"));
}

#[tokio::test]
async fn test_memory_search_validation() {
    let dir = tempfile::tempdir().unwrap();
    let runner = make_runner(dir.path()).await;

    let empty = runner
        .execute_call(&call("memory_search", serde_json::json!({"query": "  "})), "s1")
        .await;
    assert!(!empty.success);

    let bad_score = runner
        .execute_call(
            &call(
                "memory_search",
                serde_json::json!({"query": "x", "min_score": 1.5}),
            ),
            "s1",
        )
        .await;
    assert!(!bad_score.success);

    let bad_source = runner
        .execute_call(
            &call(
                "memory_search",
                serde_json::json!({"query": "x", "source": "bogus"}),
            ),
            "s1",
        )
        .await;
    assert!(!bad_source.success);
}

#[tokio::test]
async fn test_empty_corpus_search_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let runner = make_runner(dir.path()).await;

    let result = runner
        .execute_call(
            &call("memory_search", serde_json::json!({"query": "anything"})),
            "s1",
        )
        .await;
    assert!(result.success);
    assert!(result.observation.contains("no results"));
}

struct CountingTool {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ExternalTool for CountingTool {
    fn definition(&self) -> Tool {
        Tool::function("counting_tool", "test tool", serde_json::json!({"type": "object"}))
    }

    async fn execute(&self, _args: Value, _session_id: &str) -> crate::error::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Value::String("computed".to_string()))
    }
}

#[tokio::test]
async fn test_external_tool_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let mut runner = make_runner(dir.path()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    runner.register_external(Arc::new(CountingTool { calls: calls.clone() }));

    assert!(runner
        .definitions()
        .iter()
        .any(|t| t.name() == "counting_tool"));

    let result = runner
        .execute_call(&call("counting_tool", serde_json::json!({"x": 1})), "s1")
        .await;
    assert!(result.success);
    assert_eq!(result.observation, "computed");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_memoize_by_input() {
    let dir = tempfile::tempdir().unwrap();
    let mut runner = make_runner(dir.path()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    runner.register_external(Arc::new(CountingTool { calls: calls.clone() }));

    let args = serde_json::json!({"x": 1, "cache": "memoize_by_input"});
    let first = runner.execute_call(&call("counting_tool", args.clone()), "s1").await;
    assert!(first.success);
    let second = runner.execute_call(&call("counting_tool", args), "s1").await;
    assert!(second.success);
    assert_eq!(second.observation, "computed");

    // The second call was served from the cache category
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Different input misses the cache
    let other = serde_json::json!({"x": 2, "cache": "memoize_by_input"});
    runner.execute_call(&call("counting_tool", other), "s1").await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_output_level_applied() {
    let dir = tempfile::tempdir().unwrap();
    let mut runner = make_runner(dir.path()).await;

    struct VerboseTool;
    #[async_trait]
    impl ExternalTool for VerboseTool {
        fn definition(&self) -> Tool {
            Tool::function("verbose", "test", serde_json::json!({"type": "object"}))
        }
        async fn execute(&self, _args: Value, _s: &str) -> crate::error::Result<Value> {
            Ok(Value::String("y".repeat(5000)))
        }
    }
    runner.register_external(Arc::new(VerboseTool));

    let brief = runner
        .execute_call(
            &call("verbose", serde_json::json!({"response_format": "brief"})),
            "s1",
        )
        .await;
    assert!(brief.observation.chars().count() <= 201);

    let full = runner
        .execute_call(
            &call("verbose", serde_json::json!({"response_format": "full"})),
            "s1",
        )
        .await;
    assert_eq!(full.observation.len(), 5000);
}

#[tokio::test]
async fn test_large_output_spilled_to_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let mut runner = make_runner(dir.path()).await;

    struct HugeTool;
    #[async_trait]
    impl ExternalTool for HugeTool {
        fn definition(&self) -> Tool {
            Tool::function("huge", "test", serde_json::json!({"type": "object"}))
        }
        async fn execute(&self, _args: Value, _s: &str) -> crate::error::Result<Value> {
            Ok(Value::String("z".repeat(2 * 1024 * 1024)))
        }
    }
    runner.register_external(Arc::new(HugeTool));

    let result = runner
        .execute_call(
            &call("huge", serde_json::json!({"response_format": "full"})),
            "s1",
        )
        .await;
    assert!(result.success);
    let artifact_id = result.artifact_id.expect("spilled to artifact");
    assert!(artifact_id.starts_with("artifact:"));
    assert!(result.observation.contains(&artifact_id));
    assert_eq!(result.data_size_bytes, Some(2 * 1024 * 1024));

    // The artifact holds the full payload
    let file_ref = runner
        .store
        .resolve_ref(&artifact_id)
        .await
        .unwrap()
        .expect("artifact resolvable");
    let bytes = runner.store.retrieve(&file_ref).await.unwrap().unwrap();
    assert_eq!(bytes.len(), 2 * 1024 * 1024);
}

#[tokio::test]
async fn test_large_output_spilled_before_display_truncation() {
    // The spill decision must see the raw output, not the level-truncated
    // display string: default and brief levels still produce an artifact.
    let dir = tempfile::tempdir().unwrap();
    let mut runner = make_runner(dir.path()).await;

    struct HugeTool;
    #[async_trait]
    impl ExternalTool for HugeTool {
        fn definition(&self) -> Tool {
            Tool::function("huge", "test", serde_json::json!({"type": "object"}))
        }
        async fn execute(&self, _args: Value, _s: &str) -> crate::error::Result<Value> {
            Ok(Value::String("z".repeat(2 * 1024 * 1024)))
        }
    }
    runner.register_external(Arc::new(HugeTool));

    for (args, budget) in [
        (serde_json::json!({}), 2000usize),
        (serde_json::json!({"response_format": "brief"}), 200usize),
    ] {
        let result = runner.execute_call(&call("huge", args), "s1").await;
        assert!(result.success);
        let artifact_id = result.artifact_id.expect("spilled to artifact");
        assert_eq!(result.data_size_bytes, Some(2 * 1024 * 1024));
        assert!(result.observation.contains(&artifact_id));
        assert!(result.observation.chars().count() <= budget + 1);

        // Nothing was discarded: the artifact holds the whole payload
        let file_ref = runner
            .store
            .resolve_ref(&artifact_id)
            .await
            .unwrap()
            .expect("artifact resolvable");
        let bytes = runner.store.retrieve(&file_ref).await.unwrap().unwrap();
        assert_eq!(bytes.len(), 2 * 1024 * 1024);
    }
}

#[test]
fn test_normalize_json_sorts_keys() {
    let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"d": 2, "c": 3}}"#).unwrap();
    let b: Value = serde_json::from_str(r#"{"a": {"c": 3, "d": 2}, "b": 1}"#).unwrap();
    assert_eq!(normalize_json(&a), normalize_json(&b));

    let c: Value = serde_json::from_str(r#"{"a": {"c": 4, "d": 2}, "b": 1}"#).unwrap();
    assert_ne!(normalize_json(&a), normalize_json(&c));
}
