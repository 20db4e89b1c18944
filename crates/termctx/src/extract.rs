//! Background fact extraction.
//!
//! Every few completed turns the daemon asks the backend, outside the user's
//! session, which durable facts the latest answer established, and merges
//! them into memory. The pass is best-effort: a failed call, a reply that is
//! not JSON, or JSON that does not match [`ExtractedFacts`] is logged at
//! DEBUG and dropped.
//!
//! At most one extraction runs at a time. Triggers that arrive while one is
//! running are skipped rather than queued; the next cadence point catches up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::backend::Backend;
use crate::context::ExtractedFacts;
use crate::json_schema_for;

/// Longest slice of the assistant reply sent for extraction.
const MAX_REPLY_CHARS: usize = 6000;

/// System prompt for the extraction call, with the expected JSON Schema
/// embedded.
pub fn system_prompt() -> String {
    let schema = json_schema_for::<ExtractedFacts>();
    let schema = serde_json::to_string_pretty(&schema).unwrap_or_default();
    format!(
        "You maintain long-term memory for a terminal assistant. Read the \
         assistant reply you are given and list only durable facts worth \
         remembering across sessions: project properties (language, framework, \
         build tool, layout), conventions or rules the user follows, decisions \
         that were made, and notable recent actions.\n\n\
         Answer with a single JSON object and nothing else. Omit anything \
         uncertain or transient. Use empty lists when nothing qualifies.\n\n\
         JSON Schema:\n{schema}"
    )
}

/// User prompt wrapping the reply to extract from.
pub fn user_prompt(assistant_reply: &str) -> String {
    let reply: String = assistant_reply.chars().take(MAX_REPLY_CHARS).collect();
    format!("Assistant reply:\n<reply>\n{reply}\n</reply>")
}

/// Parse and validate an extraction reply.
///
/// Models like to wrap JSON in prose or code fences, so only the span from
/// the first `{` to the last `}` is considered.
pub fn parse_facts(reply: &str) -> Result<ExtractedFacts, String> {
    let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}')) else {
        return Err("no JSON object in reply".into());
    };
    if end < start {
        return Err("no JSON object in reply".into());
    }
    let json = reply
        .get(start..=end)
        .ok_or_else(|| "no JSON object in reply".to_string())?;

    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| format!("invalid JSON: {e}"))?;

    let schema = json_schema_for::<ExtractedFacts>();
    let validator =
        jsonschema::validator_for(&schema).map_err(|e| format!("invalid schema: {e}"))?;
    let errors: Vec<String> = validator
        .iter_errors(&value)
        .map(|e| format!("{}: {e}", e.instance_path()))
        .collect();
    if !errors.is_empty() {
        return Err(format!("schema violations: {}", errors.join("; ")));
    }

    serde_json::from_value(value).map_err(|e| format!("failed to decode facts: {e}"))
}

/// Ask `backend` for facts in `assistant_reply`.
pub async fn extract_facts(
    backend: &dyn Backend,
    assistant_reply: &str,
) -> Result<ExtractedFacts, String> {
    let system = system_prompt();
    let user = user_prompt(assistant_reply);
    let reply = backend
        .complete(&system, &user)
        .await
        .map_err(|e| e.to_string())?;
    parse_facts(&reply)
}

/// Single-flight gate for extraction passes.
#[derive(Debug, Clone, Default)]
pub struct ExtractionGate {
    running: Arc<AtomicBool>,
}

impl ExtractionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate, or `None` if an extraction is already running.
    pub fn try_acquire(&self) -> Option<ExtractionPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ExtractionPermit {
                running: Arc::clone(&self.running),
            })
    }
}

/// Held for the duration of one extraction pass; releases the gate on drop.
#[derive(Debug)]
pub struct ExtractionPermit {
    running: Arc<AtomicBool>,
}

impl Drop for ExtractionPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        debug!("Extraction gate released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json() {
        let reply = "Here you go:\n```json\n{\"project\": {\"language\": \"Rust\"}, \"conventions\": [\"Always run fmt\"]}\n```";
        let facts = parse_facts(reply).unwrap();
        assert_eq!(facts.project["language"], "Rust");
        assert_eq!(facts.conventions, vec!["Always run fmt"]);
        assert!(facts.decisions.is_empty());
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let facts = parse_facts("{}").unwrap();
        assert!(facts.is_empty());
    }

    #[test]
    fn rejects_schema_violations() {
        let err = parse_facts(r#"{"conventions": "not a list"}"#).unwrap_err();
        assert!(err.contains("schema violations"), "{err}");

        let err = parse_facts(r#"{"project": {"version": 3}}"#).unwrap_err();
        assert!(err.contains("schema violations"), "{err}");
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_facts("nothing to remember").is_err());
        assert!(parse_facts("} backwards {").is_err());
        assert!(parse_facts("{ broken").is_err());
    }

    #[test]
    fn prompts_embed_schema_and_reply() {
        let system = system_prompt();
        assert!(system.contains("\"conventions\""));
        assert!(system.contains("JSON Schema"));

        let long = "é".repeat(MAX_REPLY_CHARS + 10);
        let user = user_prompt(&long);
        assert_eq!(user.matches('é').count(), MAX_REPLY_CHARS);
    }

    #[test]
    fn gate_is_single_flight() {
        let gate = ExtractionGate::new();
        let permit = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        assert!(gate.clone().try_acquire().is_none());
        drop(permit);
        assert!(gate.try_acquire().is_some());
    }
}
