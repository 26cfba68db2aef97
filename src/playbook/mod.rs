//! Playbooks: categorized, feedback-derived instruction artifacts.
//!
//! A playbook is a versioned mapping from a fixed set of sections to
//! ordered lists of bullets. It is mutated only through curator operations
//! (see [`curator`]) and rendered into prompt text that agents compose with
//! their base instruction at call time.
//!
//! Playbook-level stats are recomputed in full after every mutation batch,
//! never patched incrementally, so they cannot drift from the bullets.

pub mod curator;
pub mod persistence;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use curator::CuratorOp;
pub use persistence::PlaybookStore;

/// Maximum length of the section slug used in bullet ids.
const SLUG_MAX_LEN: usize = 24;

/// Characters of random suffix appended to bullet ids.
const ID_SUFFIX_LEN: usize = 8;

/// Rough characters-per-token ratio used for the token-cost estimate.
const CHARS_PER_TOKEN: usize = 4;

// ---------------------------------------------------------------------------
// Section
// ---------------------------------------------------------------------------

/// Fixed playbook section categories.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Section {
    /// General behavioral guidance.
    Guidelines,
    /// How to shape responses for particular situations.
    ResponseStrategies,
    /// Mistakes to avoid.
    CommonPitfalls,
    /// Root-cause observations from analyzed failures.
    RootCauseNotes,
}

impl Section {
    /// All sections, in render order.
    pub fn all() -> [Section; 4] {
        [
            Section::Guidelines,
            Section::ResponseStrategies,
            Section::CommonPitfalls,
            Section::RootCauseNotes,
        ]
    }

    /// Display label.
    pub fn label(&self) -> &'static str {
        match self {
            Section::Guidelines => "Guidelines",
            Section::ResponseStrategies => "Response Strategies",
            Section::CommonPitfalls => "Common Pitfalls",
            Section::RootCauseNotes => "Root Cause Notes",
        }
    }

    /// Parse a label tolerantly (case-insensitive, separators ignored).
    pub fn from_label(label: &str) -> Option<Section> {
        let normalized: String = label
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "guidelines" => Some(Section::Guidelines),
            "responsestrategies" => Some(Section::ResponseStrategies),
            "commonpitfalls" => Some(Section::CommonPitfalls),
            "rootcausenotes" => Some(Section::RootCauseNotes),
            _ => None,
        }
    }

    /// Normalized slug used as the bullet-id prefix: lowercased, runs of
    /// non-alphanumeric characters collapsed to a hyphen, truncated.
    pub fn slug(&self) -> String {
        let mut slug = String::new();
        let mut last_was_hyphen = false;
        for c in self.label().chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
                last_was_hyphen = false;
            } else if !last_was_hyphen && !slug.is_empty() {
                slug.push('-');
                last_was_hyphen = true;
            }
        }
        slug.truncate(SLUG_MAX_LEN);
        if slug.ends_with('-') {
            slug.pop();
        }
        slug
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Generate a practically unique bullet id for a section: its slug plus a
/// random suffix. No central counter is needed.
pub fn new_bullet_id(section: Section) -> String {
    let suffix: String = Uuid::new_v4().simple().to_string();
    format!("{}-{}", section.slug(), &suffix[..ID_SUFFIX_LEN])
}

// ---------------------------------------------------------------------------
// Bullet
// ---------------------------------------------------------------------------

/// One atomic entry in a playbook section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bullet {
    /// Unique id, derived from the section slug plus a random suffix.
    pub id: String,
    /// Owning section.
    pub section: Section,
    /// Free-text content.
    pub content: String,
    /// How often this bullet was reinforced by positive feedback.
    pub helpful_count: u64,
    /// How often this bullet was implicated in negative feedback.
    pub harmful_count: u64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp.
    pub updated_at: DateTime<Utc>,
    /// Optional free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Bullet {
    fn new(section: Section, content: String) -> Self {
        let now = Utc::now();
        Self {
            id: new_bullet_id(section),
            section,
            content,
            helpful_count: 1,
            harmful_count: 0,
            created_at: now,
            updated_at: now,
            metadata: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Playbook-level statistics, recomputed in full after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybookStats {
    /// Total bullet count across all sections.
    pub bullet_count: usize,
    /// Summed helpful counters.
    pub helpful_count: u64,
    /// Summed harmful counters.
    pub harmful_count: u64,
    /// Approximate token cost of injecting the rendered playbook, derived
    /// from content length.
    pub approx_token_cost: usize,
}

// ---------------------------------------------------------------------------
// Playbook
// ---------------------------------------------------------------------------

/// The accumulated, categorized feedback artifact attached to an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
    /// Optional playbook-level description rendered as a header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Bullets per section, in insertion order within each section.
    #[serde(default)]
    pub sections: BTreeMap<Section, Vec<Bullet>>,
    /// Recomputed statistics.
    #[serde(default)]
    pub stats: PlaybookStats,
    /// Timestamp of the last mutation.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Playbook {
    /// Create an empty playbook.
    pub fn new() -> Self {
        Self {
            description: None,
            sections: BTreeMap::new(),
            stats: PlaybookStats::default(),
            updated_at: Utc::now(),
        }
    }

    /// Whether the playbook has no bullets at all.
    pub fn is_empty(&self) -> bool {
        self.sections.values().all(|bullets| bullets.is_empty())
    }

    /// Total bullet count.
    pub fn bullet_count(&self) -> usize {
        self.sections.values().map(Vec::len).sum()
    }

    /// Find a bullet by id.
    pub fn bullet(&self, id: &str) -> Option<&Bullet> {
        self.sections
            .values()
            .flat_map(|bullets| bullets.iter())
            .find(|b| b.id == id)
    }

    /// Add a bullet to a section.
    ///
    /// Skips content that is empty after trimming, and skips
    /// case-insensitive duplicates within the target section. Returns the
    /// new bullet's id when one was added.
    pub fn add_bullet(&mut self, section: Section, content: &str) -> Option<String> {
        let content = content.trim();
        if content.is_empty() {
            return None;
        }

        let bullets = self.sections.entry(section).or_default();
        let lowered = content.to_lowercase();
        if bullets.iter().any(|b| b.content.to_lowercase() == lowered) {
            log::debug!(
                "Skipping duplicate bullet in section '{}': {}",
                section,
                content
            );
            return None;
        }

        let bullet = Bullet::new(section, content.to_string());
        let id = bullet.id.clone();
        bullets.push(bullet);
        self.recompute_stats();
        Some(id)
    }

    /// Replace a bullet's content by id, bumping its updated timestamp.
    /// No-op (returns `false`) when the id is not found.
    pub fn update_bullet(&mut self, id: &str, content: &str) -> bool {
        for bullets in self.sections.values_mut() {
            if let Some(bullet) = bullets.iter_mut().find(|b| b.id == id) {
                bullet.content = content.to_string();
                bullet.updated_at = Utc::now();
                self.recompute_stats();
                return true;
            }
        }
        false
    }

    /// Delete a bullet by id. No-op (returns `false`) when not found.
    pub fn remove_bullet(&mut self, id: &str) -> bool {
        for bullets in self.sections.values_mut() {
            if let Some(pos) = bullets.iter().position(|b| b.id == id) {
                bullets.remove(pos);
                self.recompute_stats();
                return true;
            }
        }
        false
    }

    /// Recompute all playbook-level stats from scratch and stamp a new
    /// updated-at timestamp. Always a full recomputation.
    pub fn recompute_stats(&mut self) {
        let mut stats = PlaybookStats::default();
        let mut content_chars = 0usize;
        for bullets in self.sections.values() {
            for bullet in bullets {
                stats.bullet_count += 1;
                stats.helpful_count += bullet.helpful_count;
                stats.harmful_count += bullet.harmful_count;
                content_chars += bullet.content.len();
            }
        }
        stats.approx_token_cost = content_chars / CHARS_PER_TOKEN;
        self.stats = stats;
        self.updated_at = Utc::now();
    }

    /// Render the playbook into a structured text block.
    ///
    /// Returns an empty string when there are no bullets at all; callers
    /// treat that as "nothing to inject", not as an error.
    pub fn render(&self) -> String {
        if self.is_empty() {
            return String::new();
        }

        let mut out = String::from("PLAYBOOK\n");
        if let Some(description) = &self.description {
            out.push_str(description);
            out.push('\n');
        }
        for section in Section::all() {
            let Some(bullets) = self.sections.get(&section) else {
                continue;
            };
            if bullets.is_empty() {
                continue;
            }
            out.push('\n');
            out.push_str("## ");
            out.push_str(section.label());
            out.push('\n');
            for bullet in bullets {
                out.push_str(&format!("- [{}] {}\n", bullet.id, bullet.content));
            }
        }
        out
    }
}
