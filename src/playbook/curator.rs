//! Curator operations: the playbook mutation protocol.
//!
//! Free-text feedback is analyzed into a batch of ADD/UPDATE/REMOVE
//! operations. Analysis asks a model to pick one of the fixed sections and
//! rewrite the feedback while preserving every concrete specific (numbers,
//! names, constraints). When the classification call fails for any reason,
//! the protocol falls back to an ADD under Guidelines with the raw feedback
//! verbatim; the fallback path cannot fail.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ModelSettings;
use crate::model::{ModelClient, ModelRequest};
use crate::playbook::{Playbook, Section};

// ---------------------------------------------------------------------------
// CuratorOp
// ---------------------------------------------------------------------------

/// One mutation applied to a playbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
pub enum CuratorOp {
    /// Insert a new bullet (deduplicated, empty content skipped).
    Add {
        /// Target section.
        section: Section,
        /// Bullet content.
        content: String,
    },
    /// Replace an existing bullet's content by id (no-op when missing).
    Update {
        /// Bullet id.
        id: String,
        /// Replacement content.
        content: String,
    },
    /// Delete a bullet by id (no-op when missing).
    Remove {
        /// Bullet id.
        id: String,
    },
}

/// Apply a batch of operations, then recompute stats once.
///
/// Returns the number of operations that changed the playbook.
pub fn apply_ops(playbook: &mut Playbook, ops: &[CuratorOp]) -> usize {
    let mut applied = 0;
    for op in ops {
        let changed = match op {
            CuratorOp::Add { section, content } => {
                playbook.add_bullet(*section, content).is_some()
            }
            CuratorOp::Update { id, content } => playbook.update_bullet(id, content),
            CuratorOp::Remove { id } => playbook.remove_bullet(id),
        };
        if changed {
            applied += 1;
        }
    }
    // Mutation methods recompute as they go; one final pass covers the
    // batch as a whole (and stamps updated_at even for no-op batches of
    // mixed operations).
    if applied > 0 {
        playbook.recompute_stats();
    }
    applied
}

// ---------------------------------------------------------------------------
// Feedback analysis
// ---------------------------------------------------------------------------

/// Classification prompt sent to the analysis model.
fn analysis_instruction() -> String {
    let labels: Vec<&str> = Section::all().iter().map(|s| s.label()).collect();
    format!(
        "You maintain an agent's playbook of learned behaviors. Classify the \
         user feedback into exactly one of these sections: {}. Rewrite the \
         feedback as a single imperative instruction, preserving every \
         concrete specific (numbers, names, constraints) from the original. \
         Respond with JSON: {{\"section\": \"<section>\", \"content\": \
         \"<instruction>\"}}.",
        labels.join(", ")
    )
}

/// Analyze one piece of feedback into curator operations.
///
/// Uses the provided model (the teacher model when configured, otherwise
/// the agent's own). Any failure — invocation error, unparseable output,
/// unknown section — falls back to an ADD under
/// [`Section::Guidelines`] with the raw feedback text verbatim. This
/// function never fails and never returns an empty batch for non-empty
/// feedback.
pub async fn analyze_feedback(
    model: &dyn ModelClient,
    settings: &ModelSettings,
    feedback: &str,
) -> Vec<CuratorOp> {
    let request = ModelRequest {
        instruction: analysis_instruction(),
        input: serde_json::json!({ "feedback": feedback }),
        settings: settings.clone(),
    };

    match model.invoke(request).await {
        Ok(response) => match parse_analysis(&response.output) {
            Some(op) => vec![op],
            None => {
                log::warn!(
                    "Feedback analysis produced unusable output; falling back to Guidelines"
                );
                vec![fallback_op(feedback)]
            }
        },
        Err(e) => {
            log::warn!(
                "Feedback analysis call failed ({}); falling back to Guidelines",
                e
            );
            vec![fallback_op(feedback)]
        }
    }
}

/// Fallback operation: raw feedback under Guidelines. Cannot fail.
pub fn fallback_op(feedback: &str) -> CuratorOp {
    CuratorOp::Add {
        section: Section::Guidelines,
        content: feedback.to_string(),
    }
}

static JSON_OBJECT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{[\s\S]*\}").expect("valid regex"));

/// Extract `{"section": .., "content": ..}` from a model response value.
///
/// The response may be a JSON object directly, or text containing one.
fn parse_analysis(output: &Value) -> Option<CuratorOp> {
    let candidate = match output {
        Value::Object(_) => {
            // Either the object itself, or a text field wrapping JSON.
            if output.get("section").is_some() {
                output.clone()
            } else {
                let text = output.get("output").and_then(Value::as_str)?;
                extract_json(text)?
            }
        }
        Value::String(text) => extract_json(text)?,
        _ => return None,
    };

    let section = Section::from_label(candidate.get("section")?.as_str()?)?;
    let content = candidate.get("content")?.as_str()?.trim().to_string();
    if content.is_empty() {
        return None;
    }
    Some(CuratorOp::Add { section, content })
}

fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let m = JSON_OBJECT_RE.find(text)?;
    serde_json::from_str::<Value>(m.as_str()).ok()
}
