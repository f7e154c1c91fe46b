// src/tools/mod.rs
// Built-in tool dispatch: sandbox tools, memory search, and host-registered
// external tools (skill activation among them)

pub mod types;

use crate::error::{AgentError, Result};
use crate::filestore::{FileCategory, FileStore, StoreOptions};
use crate::llm::{Tool, ToolCall};
use crate::memory::{MemoryIndexer, SearchOptions};
use crate::sandbox::{validate_command, validate_python_code, DockerSandbox};
use crate::utils::content_hash;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub use types::{CachePolicy, OutputLevel, ToolExecutionResult};

/// Results larger than this are spilled to the artifact category and
/// replaced by a reference
const SPILL_THRESHOLD_BYTES: usize = 1024 * 1024;

/// A tool implemented outside the core (skills, report renderers, ...)
#[async_trait]
pub trait ExternalTool: Send + Sync {
    fn definition(&self) -> Tool;
    async fn execute(&self, args: Value, session_id: &str) -> Result<Value>;
}

/// Dispatches tool calls from the agent loop. Stateless per call; shared
/// handles are all thread-safe.
pub struct ToolRunner {
    store: Arc<FileStore>,
    indexer: Arc<MemoryIndexer>,
    sandbox: Arc<DockerSandbox>,
    command_whitelist: Vec<String>,
    allowed_imports: std::collections::HashSet<String>,
    search_defaults: SearchOptions,
    external: HashMap<String, Arc<dyn ExternalTool>>,
}

impl ToolRunner {
    pub fn new(
        store: Arc<FileStore>,
        indexer: Arc<MemoryIndexer>,
        sandbox: Arc<DockerSandbox>,
        command_whitelist: Vec<String>,
        search_defaults: SearchOptions,
    ) -> Self {
        Self {
            store,
            indexer,
            sandbox,
            command_whitelist,
            allowed_imports: crate::sandbox::default_allowed_imports(),
            search_defaults,
            external: HashMap::new(),
        }
    }

    /// Register a host-provided tool (e.g. `activate_skill`).
    pub fn register_external(&mut self, tool: Arc<dyn ExternalTool>) {
        self.external.insert(tool.definition().name().to_string(), tool);
    }

    /// Tool definitions advertised to the model.
    pub fn definitions(&self) -> Vec<Tool> {
        let mut tools = vec![
            Tool::function(
                "run_python",
                "Execute Python code in an isolated sandbox. Only whitelisted \
                 data-analysis modules may be imported; file writes and network \
                 access are blocked.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "code": {"type": "string", "description": "Python source to execute"},
                        "timeout": {"type": "integer", "minimum": 5, "maximum": 300},
                        "response_format": {"type": "string", "enum": ["brief", "standard", "full"]}
                    },
                    "required": ["code"]
                }),
            ),
            Tool::function(
                "execute_command",
                "Run a whitelisted shell command in an isolated sandbox.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "command": {"type": "string"},
                        "timeout": {"type": "integer", "minimum": 1, "maximum": 300},
                        "response_format": {"type": "string", "enum": ["brief", "standard", "full"]}
                    },
                    "required": ["command"]
                }),
            ),
            Tool::function(
                "memory_search",
                "Search long-term memory with hybrid full-text + semantic \
                 retrieval. Returns scored snippets with file references.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "max_results": {"type": "integer", "minimum": 1, "maximum": 100},
                        "min_score": {"type": "number", "minimum": 0, "maximum": 1},
                        "source": {"type": "string", "enum": ["all", "memory", "sessions"]},
                        "use_hybrid": {"type": "boolean"}
                    },
                    "required": ["query"]
                }),
            ),
        ];
        for tool in self.external.values() {
            tools.push(tool.definition());
        }
        tools
    }

    /// Execute one tool call. Never returns an error: every failure becomes
    /// a failed `ToolExecutionResult` the model can reason about.
    pub async fn execute_call(&self, call: &ToolCall, session_id: &str) -> ToolExecutionResult {
        let start = Instant::now();
        let tool_name = call.function.name.as_str();

        let args: Value = match serde_json::from_str(&call.function.arguments) {
            Ok(v) => v,
            Err(e) => {
                let err = AgentError::BadInput(format!("malformed tool arguments: {}", e));
                return ToolExecutionResult::failed(&call.id, tool_name, &err, OutputLevel::default())
                    .with_duration(start.elapsed().as_millis() as u64);
            }
        };
        let output_level = args
            .get("response_format")
            .and_then(|v| v.as_str())
            .map(OutputLevel::parse)
            .unwrap_or_default();
        let cache_policy = args
            .get("cache")
            .and_then(|v| v.as_str())
            .map(|s| {
                if s == "memoize_by_input" {
                    CachePolicy::MemoizeByInput
                } else {
                    CachePolicy::NoCache
                }
            })
            .unwrap_or_default();

        if cache_policy == CachePolicy::MemoizeByInput {
            if let Some(cached) = self.memo_lookup(tool_name, &args, &call.id).await {
                debug!("Tool {} served from cache", tool_name);
                return cached.with_duration(start.elapsed().as_millis() as u64);
            }
        }

        let outcome = self
            .dispatch(tool_name, &args, session_id, output_level)
            .await;
        let result = match outcome {
            // The spill decision looks at the raw observation, before any
            // display-level truncation can hide its size.
            Ok(observation) if observation.len() > SPILL_THRESHOLD_BYTES => {
                self.spill_to_artifact(&call.id, tool_name, observation, output_level, session_id)
                    .await
            }
            Ok(observation) => {
                ToolExecutionResult::ok(&call.id, tool_name, observation, output_level)
            }
            Err(err) => {
                if matches!(err, AgentError::Internal(_) | AgentError::Db(_) | AgentError::Io(_)) {
                    warn!("Tool {} failed internally: {}", tool_name, err);
                }
                ToolExecutionResult::failed(&call.id, tool_name, &err, output_level)
            }
        };

        if cache_policy == CachePolicy::MemoizeByInput && result.success {
            self.memo_store(tool_name, &args, &result).await;
        }
        result.with_duration(start.elapsed().as_millis() as u64)
    }

    async fn dispatch(
        &self,
        tool_name: &str,
        args: &Value,
        session_id: &str,
        _output_level: OutputLevel,
    ) -> Result<String> {
        match tool_name {
            "run_python" => self.run_python(args).await,
            "execute_command" => self.run_command(args).await,
            "memory_search" => self.memory_search(args).await,
            _ => match self.external.get(tool_name) {
                Some(tool) => {
                    let value = tool.execute(args.clone(), session_id).await?;
                    Ok(match value {
                        Value::String(s) => s,
                        other => serde_json::to_string(&other)?,
                    })
                }
                None => Err(AgentError::BadInput(format!("unknown tool: {}", tool_name))),
            },
        }
    }

    async fn run_python(&self, args: &Value) -> Result<String> {
        let code = args
            .get("code")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::BadInput("missing 'code' argument".to_string()))?;
        let timeout = args
            .get("timeout")
            .and_then(|v| v.as_u64())
            .map(|t| t.clamp(5, 300));

        // Validation happens before any container is started.
        validate_python_code(code, &self.allowed_imports)?;

        let output = self.sandbox.execute_code(code, timeout).await?;
        if output.success() {
            if output.stdout.trim().is_empty() {
                Ok("code executed successfully with no output".to_string())
            } else {
                Ok(output.stdout)
            }
        } else {
            Err(AgentError::BadInput(format!(
                "code exited with status {}: {}",
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }

    async fn run_command(&self, args: &Value) -> Result<String> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::BadInput("missing 'command' argument".to_string()))?;
        let timeout = args
            .get("timeout")
            .and_then(|v| v.as_u64())
            .map(|t| t.clamp(1, 300));

        validate_command(command, &self.command_whitelist)?;

        let output = self.sandbox.execute_command(command, timeout).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(AgentError::BadInput(format!(
                "command exited with status {}: {}",
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }

    async fn memory_search(&self, args: &Value) -> Result<String> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::BadInput("missing 'query' argument".to_string()))?;
        if query.trim().is_empty() {
            return Err(AgentError::BadInput("query must not be empty".to_string()));
        }
        if query.len() > 5000 {
            return Err(AgentError::BadInput("query too long (max 5000 chars)".to_string()));
        }

        let mut opts = self.search_defaults.clone();
        if let Some(n) = args.get("max_results").and_then(|v| v.as_u64()) {
            opts.max_results = (n as usize).clamp(1, 100);
        }
        if let Some(s) = args.get("min_score").and_then(|v| v.as_f64()) {
            if !(0.0..=1.0).contains(&s) {
                return Err(AgentError::BadInput("min_score must be in [0, 1]".to_string()));
            }
            opts.min_score = s;
        }
        if let Some(source) = args.get("source").and_then(|v| v.as_str()) {
            opts.source_filter = match source {
                "all" => None,
                "memory" | "sessions" => Some(source.to_string()),
                other => {
                    return Err(AgentError::BadInput(format!("invalid source: {}", other)))
                }
            };
        }
        if let Some(h) = args.get("use_hybrid").and_then(|v| v.as_bool()) {
            opts.use_hybrid = h;
        }

        let response = self.indexer.search(query, &opts).await?;
        Ok(format_search_results(query, &opts, &response))
    }

    fn memo_key(&self, tool_name: &str, args: &Value) -> String {
        let normalized = normalize_json(args);
        content_hash(format!("{}:{}", tool_name, normalized).as_bytes())[..32].to_string()
    }

    async fn memo_lookup(
        &self,
        tool_name: &str,
        args: &Value,
        tool_call_id: &str,
    ) -> Option<ToolExecutionResult> {
        let key = self.memo_key(tool_name, args);
        let file_ref = self
            .store
            .resolve_ref(&format!("cache:{}", key))
            .await
            .ok()??;
        let bytes = self.store.retrieve(&file_ref).await.ok()??;
        let mut result: ToolExecutionResult = serde_json::from_slice(&bytes).ok()?;
        result.tool_call_id = tool_call_id.to_string();
        Some(result)
    }

    async fn memo_store(&self, tool_name: &str, args: &Value, result: &ToolExecutionResult) {
        let key = self.memo_key(tool_name, args);
        let Ok(bytes) = serde_json::to_vec(result) else {
            return;
        };
        if let Err(e) = self
            .store
            .store_with_id(&bytes, FileCategory::Cache, &key, StoreOptions::default())
            .await
        {
            warn!("Failed to memoize {} result: {}", tool_name, e);
        }
    }

    /// Spill an oversized raw observation into the artifact category,
    /// leaving a reference behind. Runs before display truncation so no
    /// output level can silently discard data. This is the executor's only
    /// direct write into C1.
    async fn spill_to_artifact(
        &self,
        tool_call_id: &str,
        tool_name: &str,
        observation: String,
        output_level: OutputLevel,
        session_id: &str,
    ) -> ToolExecutionResult {
        let bytes = observation.as_bytes().to_vec();
        let opts = StoreOptions {
            filename: Some(format!("{}-output.txt", tool_name)),
            session_id: Some(session_id.to_string()),
            mime_type: Some("text/plain".to_string()),
            metadata: None,
        };
        match self.store.store(&bytes, FileCategory::Artifact, opts).await {
            Ok(file_ref) => {
                let notice = format!(
                    "output too large for inline display ({} bytes); stored as {}",
                    bytes.len(),
                    file_ref.to_ref_string()
                );
                let mut result =
                    ToolExecutionResult::ok(tool_call_id, tool_name, notice, output_level);
                result.data_size_bytes = Some(bytes.len() as u64);
                result.data_hash = Some(file_ref.hash.clone());
                result.artifact_id = Some(file_ref.to_ref_string());
                result
            }
            Err(e) => {
                warn!("Failed to spill large tool output: {}", e);
                let clipped = crate::utils::truncate_chars(&observation, SPILL_THRESHOLD_BYTES);
                ToolExecutionResult::ok(tool_call_id, tool_name, clipped, output_level)
            }
        }
    }
}

/// JSON with object keys sorted recursively, for stable memo keys
fn normalize_json(value: &Value) -> String {
    fn normalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
                sorted.sort_by_key(|(k, _)| k.as_str());
                let mut out = serde_json::Map::new();
                for (k, v) in sorted {
                    out.insert(k.clone(), normalize(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
            other => other.clone(),
        }
    }
    normalize(value).to_string()
}

/// Markdown rendering of search results for the model
fn format_search_results(
    query: &str,
    opts: &SearchOptions,
    response: &crate::memory::SearchResponse,
) -> String {
    if response.results.is_empty() {
        return format!("no results matched \"{}\"", query);
    }

    let mode = if response.used_hybrid {
        "hybrid (FTS + vector)"
    } else {
        "full-text"
    };
    let mut out = format!(
        "## Search results: \"{}\"\n\nmode: {} | {} match(es) | min score {:.2}\n",
        query,
        mode,
        response.results.len(),
        opts.min_score
    );
    if response.degraded {
        out.push_str("(vector branch unavailable, text-only results)\n");
    }

    for (i, result) in response.results.iter().enumerate() {
        out.push_str(&format!(
            "\n### {}. {}:{}\nrelevance: {:.2}\n",
            i + 1,
            result.path,
            result.start_line,
            result.score
        ));
        if !result.file_refs.is_empty() {
            let refs: Vec<String> = result
                .file_refs
                .iter()
                .map(|r| format!("`{}:{}`", r.category, r.file_id))
                .collect();
            out.push_str(&format!("related files: {}\n", refs.join(", ")));
        }
        let context = crate::utils::truncate_chars(&result.context, 500);
        out.push_str(&format!("```\n{}\n```\n", context));
    }
    out
}

#[cfg(test)]
mod runner_tests;
