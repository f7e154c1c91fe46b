// src/memory/flush.rs
// Token-budgeted memory compaction: retain-record grammar, extraction
// (LLM with regex fallback), and threshold-driven flushing to daily
// markdown files in the memory category.

use crate::config::FlushConfig;
use crate::error::Result;
use crate::filestore::{FileRef, FileStore};
use crate::llm::{LlmClient, Message};
use chrono::{DateTime, Local, Utc};
use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The four durable-fact kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainKind {
    /// World fact
    World,
    /// Biographical fact
    Bio,
    /// Opinion, with confidence
    Opinion,
    /// Summary
    Summary,
}

impl RetainKind {
    pub fn letter(&self) -> char {
        match self {
            Self::World => 'W',
            Self::Bio => 'B',
            Self::Opinion => 'O',
            Self::Summary => 'S',
        }
    }
}

/// One parsed retain line: `TYPE CONF? ENTITY? ':' SP CONTENT`
#[derive(Debug, Clone, PartialEq)]
pub struct RetainRecord {
    pub kind: RetainKind,
    pub entity: Option<String>,
    pub content: String,
    /// Only meaningful for opinions
    pub confidence: Option<f64>,
}

impl RetainRecord {
    pub fn world(content: impl Into<String>, entity: Option<String>) -> Self {
        Self {
            kind: RetainKind::World,
            entity,
            content: content.into(),
            confidence: None,
        }
    }

    pub fn bio(content: impl Into<String>, entity: Option<String>) -> Self {
        Self {
            kind: RetainKind::Bio,
            entity,
            content: content.into(),
            confidence: None,
        }
    }

    pub fn opinion(content: impl Into<String>, confidence: f64, entity: Option<String>) -> Self {
        Self {
            kind: RetainKind::Opinion,
            entity,
            content: content.into(),
            confidence: Some(confidence),
        }
    }

    pub fn summary(content: impl Into<String>, entity: Option<String>) -> Self {
        Self {
            kind: RetainKind::Summary,
            entity,
            content: content.into(),
            confidence: None,
        }
    }

    /// Serialise as a single markdown line. A 0.5 opinion confidence is the
    /// default and is omitted from the rendered form.
    pub fn format(&self) -> String {
        let mut out = String::new();
        out.push(self.kind.letter());
        if self.kind == RetainKind::Opinion {
            if let Some(c) = self.confidence {
                if (c - 0.5).abs() > f64::EPSILON {
                    out.push_str(&format!("(c={:.1})", c));
                }
            }
        }
        if let Some(entity) = &self.entity {
            out.push_str(&format!(" @{}", entity));
        }
        out.push_str(": ");
        out.push_str(&self.content);
        out
    }
}

fn parse_prefix(prefix: &str) -> Option<(RetainKind, Option<f64>)> {
    static OPINION_RE: OnceLock<Regex> = OnceLock::new();
    let opinion_re =
        OPINION_RE.get_or_init(|| Regex::new(r"^O\(c=(\d+\.?\d*)\)$").expect("valid regex"));

    match prefix {
        "W" => return Some((RetainKind::World, None)),
        "B" => return Some((RetainKind::Bio, None)),
        "S" => return Some((RetainKind::Summary, None)),
        "O" => return Some((RetainKind::Opinion, None)),
        _ => {}
    }
    let caps = opinion_re.captures(prefix)?;
    let confidence = caps[1].parse::<f64>().ok()?;
    Some((RetainKind::Opinion, Some(confidence)))
}

/// Parse a retain line. Accepts both `TYPE: content` and
/// `TYPE @entity: content` shapes (with the optional `(c=X)` for opinions).
pub fn parse_retain(line: &str) -> Option<RetainRecord> {
    let line = line.trim();

    if let Some(at_pos) = line.find(" @") {
        if let Some(colon_rel) = line[at_pos..].find(": ") {
            let colon_pos = at_pos + colon_rel;
            if at_pos > 0 && colon_pos > at_pos {
                let prefix = line[..at_pos].trim();
                let entity = line[at_pos + 2..colon_pos].trim();
                let content = line[colon_pos + 2..].trim();
                if let Some((kind, confidence)) = parse_prefix(prefix) {
                    if !entity.is_empty() && !entity.contains(':') {
                        return Some(RetainRecord {
                            kind,
                            entity: Some(entity.to_string()),
                            content: content.to_string(),
                            confidence,
                        });
                    }
                }
            }
        }
    }

    let colon_pos = line.find(": ")?;
    let prefix = line[..colon_pos].trim();
    let content = line[colon_pos + 2..].trim();
    let (kind, confidence) = parse_prefix(prefix)?;
    Some(RetainRecord {
        kind,
        entity: None,
        content: content.to_string(),
        confidence,
    })
}

/// Lines that look like retain records even when strict parsing fails are
/// kept as-is (the extractor model occasionally emits slight variants).
fn looks_like_retain(line: &str) -> bool {
    ["W:", "B:", "O:", "S:", "W @", "B @", "O(", "S @"]
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

/// A buffered conversation message awaiting compaction
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub role: String,
    pub content: String,
    pub timestamp: i64,
}

const EXTRACTOR_SYSTEM_PROMPT: &str = "\
You are a memory extraction assistant. Analyse the conversation and extract \
only information worth keeping long-term, one fact per line, in the Retain \
format:

- `W @entity: fact` — world fact (e.g. `W @Python: Python is a programming language`)
- `B @entity: fact` — biographical fact (e.g. `B: the user prefers coffee`)
- `O(c=X) @entity: opinion` — opinion with confidence 0.0-1.0 (e.g. `O(c=0.8) @React: React suits this team`)
- `S @entity: summary` — summary (e.g. `S: we designed the memory system`)

Rules:
1. Extract only genuinely important, durable information.
2. One memory per line, nothing else — no commentary, no code fences.
3. Omit `@entity` when there is no clear entity.
4. Opinions need an explicit confidence; default to 0.7.
5. Return an empty response when nothing is worth keeping.";

/// Extracts retain records from buffered messages. The LLM path is primary;
/// regex heuristics are the lossy, advisory fallback and never fail a turn.
pub struct MemoryExtractor {
    client: Option<Arc<dyn LlmClient>>,
    timeout: Duration,
}

impl MemoryExtractor {
    pub fn new(client: Option<Arc<dyn LlmClient>>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn uses_llm(&self) -> bool {
        self.client.is_some()
    }

    /// Extract retain lines from the buffer.
    pub async fn extract(&self, messages: &[BufferedMessage]) -> Vec<String> {
        let valid: Vec<&BufferedMessage> =
            messages.iter().filter(|m| !m.content.is_empty()).collect();
        if valid.is_empty() {
            return Vec::new();
        }

        if let Some(client) = &self.client {
            match self.extract_with_llm(client.as_ref(), &valid).await {
                Ok(memories) if !memories.is_empty() => {
                    info!("Extractor produced {} memories via LLM", memories.len());
                    return memories;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("LLM extraction failed, falling back to heuristics: {}", e);
                }
            }
        }

        let memories = extract_with_heuristics(&valid);
        if !memories.is_empty() {
            info!("Extractor produced {} memories via heuristics", memories.len());
        }
        memories
    }

    async fn extract_with_llm(
        &self,
        client: &dyn LlmClient,
        messages: &[&BufferedMessage],
    ) -> anyhow::Result<Vec<String>> {
        let mut conversation = String::new();
        for msg in messages {
            match msg.role.as_str() {
                "user" => conversation.push_str(&format!("User: {}\n", msg.content)),
                "assistant" => conversation.push_str(&format!("Assistant: {}\n", msg.content)),
                _ => {}
            }
        }

        let chat = client.chat(
            vec![
                Message::system(EXTRACTOR_SYSTEM_PROMPT),
                Message::user(conversation),
            ],
            None,
        );
        let result = tokio::time::timeout(self.timeout, chat)
            .await
            .map_err(|_| anyhow::anyhow!("extractor timed out"))??;

        let mut memories = Vec::new();
        for line in result.message.text().lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("```") {
                continue;
            }
            if parse_retain(line).is_some() || looks_like_retain(line) {
                memories.push(line.to_string());
            }
        }
        Ok(memories)
    }
}

/// Regex heuristics over the buffer: explicit notes and copula patterns in
/// user messages, summary markers in assistant replies. Facts shorter than
/// six characters are noise.
fn extract_with_heuristics(messages: &[&BufferedMessage]) -> Vec<String> {
    static WORLD_RES: OnceLock<Vec<Regex>> = OnceLock::new();
    static BIO_RES: OnceLock<Vec<Regex>> = OnceLock::new();
    static OPINION_RES: OnceLock<Vec<Regex>> = OnceLock::new();
    static SUMMARY_RES: OnceLock<Vec<Regex>> = OnceLock::new();

    let world = WORLD_RES.get_or_init(|| {
        vec![
            Regex::new(r"(?i)(?:记住|note|remember)\s*[：:]\s*([^.。\n]+)").expect("valid regex"),
            Regex::new(r"([^.。\n]{2,}?)是([^.。\n]+)").expect("valid regex"),
        ]
    });
    let bio = BIO_RES.get_or_init(|| {
        vec![
            Regex::new(r"(?:我|用户)\s*(?:喜欢|偏好|习惯|爱好)\s*([^.。\n]+)")
                .expect("valid regex"),
            Regex::new(r"(?i)\b(?:I|the user)\s+(?:like|prefer|always use)s?\s+([^.\n]+)")
                .expect("valid regex"),
        ]
    });
    let opinion = OPINION_RES.get_or_init(|| {
        vec![
            Regex::new(r"(?:认为|觉得|建议|推荐)\s*([^.。\n]+)").expect("valid regex"),
            Regex::new(r"(?i)(?:I think|I believe|recommend)\s+(?:that\s+)?([^.\n]+)")
                .expect("valid regex"),
        ]
    });
    let summary = SUMMARY_RES.get_or_init(|| {
        vec![
            Regex::new(r"(?:总结|概括|综上)(?:来说)?[：:]\s*([^.。\n]+)").expect("valid regex"),
            Regex::new(r"(?i)(?:in summary|to summarize)[,:]?\s*([^.\n]+)").expect("valid regex"),
        ]
    });

    let min_len = 6;
    let mut memories = Vec::new();

    for msg in messages {
        match msg.role.as_str() {
            "user" => {
                for re in world {
                    for caps in re.captures_iter(&msg.content) {
                        let fact = caps[1].trim();
                        if fact.chars().count() >= min_len {
                            memories.push(RetainRecord::world(fact, None).format());
                        }
                    }
                }
                for re in bio {
                    for caps in re.captures_iter(&msg.content) {
                        let fact = caps[1].trim();
                        if fact.chars().count() >= min_len {
                            memories.push(RetainRecord::bio(fact, None).format());
                        }
                    }
                }
                for re in opinion {
                    for caps in re.captures_iter(&msg.content) {
                        let text = caps[1].trim();
                        if text.chars().count() >= min_len {
                            memories.push(RetainRecord::opinion(text, 0.7, None).format());
                        }
                    }
                }
            }
            "assistant" => {
                for re in summary {
                    if let Some(caps) = re.captures(&msg.content) {
                        let text = caps[1].trim();
                        if text.chars().count() >= 10 {
                            memories.push(RetainRecord::summary(text, None).format());
                            break;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    memories
}

/// Outcome of a `check_and_flush` call
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FlushOutcome {
    pub flushed: bool,
    pub memories_extracted: usize,
    pub memories_written: usize,
    pub reason: Option<String>,
    pub error: Option<String>,
}

/// Snapshot of the flush monitor's state
#[derive(Debug, Clone, serde::Serialize)]
pub struct FlushStatus {
    pub session_start: DateTime<Utc>,
    pub session_age_seconds: i64,
    pub message_count: u64,
    pub total_tokens: u64,
    pub last_flush_tokens: u64,
    pub buffer_size: usize,
    pub soft_threshold: u64,
    pub hard_threshold: u64,
    pub uses_llm: bool,
}

/// Per-conversation flush monitor. Watches the running token count and
/// persists extracted memories when thresholds are crossed.
pub struct MemoryFlush {
    config: FlushConfig,
    extractor: MemoryExtractor,
    session_start: DateTime<Utc>,
    message_count: u64,
    total_tokens: u64,
    last_flush_tokens: u64,
    message_buffer: Vec<BufferedMessage>,
    flushed_at_compaction_count: Option<u64>,
}

impl MemoryFlush {
    pub fn new(config: FlushConfig, extractor: MemoryExtractor) -> Self {
        Self {
            config,
            extractor,
            session_start: Utc::now(),
            message_count: 0,
            total_tokens: 0,
            last_flush_tokens: 0,
            message_buffer: Vec::new(),
            flushed_at_compaction_count: None,
        }
    }

    /// Buffer a conversation message for later extraction
    pub fn add_message(&mut self, role: &str, content: &str) {
        self.message_count += 1;
        self.message_buffer.push(BufferedMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now().timestamp(),
        });
    }

    pub fn buffer_len(&self) -> usize {
        self.message_buffer.len()
    }

    pub fn last_flush_tokens(&self) -> u64 {
        self.last_flush_tokens
    }

    fn should_flush(&self, current_tokens: u64) -> bool {
        if current_tokens >= self.config.hard_threshold() {
            return true;
        }
        if current_tokens >= self.config.soft_threshold_tokens {
            // Each flush must capture meaningful new material.
            let delta = current_tokens.saturating_sub(self.last_flush_tokens);
            if delta >= self.config.reserve_tokens_floor {
                return true;
            }
        }
        false
    }

    fn flush_reason(&self, current_tokens: u64) -> String {
        if current_tokens >= self.config.hard_threshold() {
            format!(
                "hard threshold ({} >= {})",
                current_tokens,
                self.config.hard_threshold()
            )
        } else if current_tokens >= self.config.soft_threshold_tokens {
            format!(
                "soft threshold ({} >= {})",
                current_tokens, self.config.soft_threshold_tokens
            )
        } else {
            "forced".to_string()
        }
    }

    fn session_age_hours(&self) -> f64 {
        (Utc::now() - self.session_start).num_seconds() as f64 / 3600.0
    }

    /// Check the trigger predicate and flush when it fires.
    ///
    /// `compaction_count` is the caller's current compaction tick; a second
    /// flush at the same tick is refused. `artifact_refs` are tool artifacts
    /// of the turn, recorded as a back-reference block in the markdown.
    pub async fn check_and_flush(
        &mut self,
        store: &FileStore,
        current_tokens: u64,
        compaction_count: u64,
        force: bool,
        artifact_refs: &[FileRef],
    ) -> FlushOutcome {
        self.total_tokens = current_tokens;

        let mut outcome = FlushOutcome::default();

        if !self.config.enabled {
            return outcome;
        }
        if self.flushed_at_compaction_count == Some(compaction_count) {
            debug!("Flush suppressed: already flushed at compaction {}", compaction_count);
            return outcome;
        }
        if self.message_buffer.is_empty() {
            return outcome;
        }
        if !force && !self.should_flush(current_tokens) {
            return outcome;
        }

        info!(
            "Memory flush triggered: tokens={}, force={}",
            current_tokens, force
        );
        let memories = self.extractor.extract(&self.message_buffer).await;

        // Force bypasses the eligibility filter entirely.
        let eligible = force
            || (memories.len() >= self.config.min_memory_count
                && self.session_age_hours() <= self.config.max_memory_age_hours);
        if !eligible {
            debug!(
                "Flush skipped: {} memories (< {}) or session age {:.1}h (> {:.1}h)",
                memories.len(),
                self.config.min_memory_count,
                self.session_age_hours(),
                self.config.max_memory_age_hours
            );
            return outcome;
        }

        match write_flush_markdown(store, &memories, artifact_refs).await {
            Ok(written) => {
                outcome.flushed = true;
                outcome.memories_extracted = memories.len();
                outcome.memories_written = written;
                outcome.reason = Some(self.flush_reason(current_tokens));
                info!(
                    "Memory flush complete: extracted={}, written={}, reason={}",
                    memories.len(),
                    written,
                    outcome.reason.as_deref().unwrap_or("")
                );
                self.message_buffer.clear();
                self.last_flush_tokens = current_tokens;
                self.flushed_at_compaction_count = Some(compaction_count);
            }
            Err(e) => {
                outcome.error = Some(e.to_string());
                warn!("Memory flush failed: {}", e);
            }
        }

        outcome
    }

    pub fn status(&self) -> FlushStatus {
        FlushStatus {
            session_start: self.session_start,
            session_age_seconds: (Utc::now() - self.session_start).num_seconds(),
            message_count: self.message_count,
            total_tokens: self.total_tokens,
            last_flush_tokens: self.last_flush_tokens,
            buffer_size: self.message_buffer.len(),
            soft_threshold: self.config.soft_threshold_tokens,
            hard_threshold: self.config.hard_threshold(),
            uses_llm: self.extractor.uses_llm(),
        }
    }

    /// Reset all session state
    pub fn reset(&mut self) {
        self.session_start = Utc::now();
        self.message_count = 0;
        self.total_tokens = 0;
        self.last_flush_tokens = 0;
        self.message_buffer.clear();
        self.flushed_at_compaction_count = None;
    }
}

/// Append the flush block to `memory/YYYY-MM-DD.md` through the file store.
async fn write_flush_markdown(
    store: &FileStore,
    memories: &[String],
    artifact_refs: &[FileRef],
) -> Result<usize> {
    let now = Local::now();
    let filename = format!("{}.md", now.format("%Y-%m-%d"));

    let mut block = format!("\n## Memory Flush ({})\n\n", now.format("%H:%M:%S"));
    for memory in memories {
        block.push_str(&format!("- {}\n", memory));
    }
    if !artifact_refs.is_empty() {
        block.push_str("\n**Related files:**\n");
        for file_ref in artifact_refs {
            block.push_str(&format!("- `{}`\n", file_ref.to_ref_string()));
        }
    }
    block.push('\n');

    store.append_memory_markdown(&filename, &block).await?;
    Ok(memories.len())
}
