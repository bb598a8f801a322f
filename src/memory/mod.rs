//! Long-term memory: learns facts from chat text and renders them back as a
//! bounded prompt summary. All persistence flows through the storage engine;
//! this layer owns only the merge policy and the rendering.

pub mod extract;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::store::{Fact, FactCategory, FactSource, FactWrite, StorageEngine};
use crate::Result;

pub use extract::{extract_candidates, strip_directive_tags, Candidate};

/// Per-candidate result of a learn pass. Learning is best-effort: storage
/// failures degrade to `Dropped`, never to an error.
#[derive(Debug)]
pub enum LearnOutcome {
    Stored(Fact),
    Dropped { candidate: Candidate, reason: String },
}

pub struct MemoryManager {
    engine: Arc<StorageEngine>,
    cfg: MemoryConfig,
}

impl MemoryManager {
    pub fn new(engine: Arc<StorageEngine>, cfg: MemoryConfig) -> Self {
        Self { engine, cfg }
    }

    /// Extracts fact candidates from `text` and persists the survivors of
    /// the merge policy: for single-valued categories only the last span in
    /// the text reaches storage (where it then replaces any prior value),
    /// multi-valued candidates are deduplicated case-insensitively within
    /// the text and against the store. An empty vec means nothing matched.
    pub async fn learn_from_text(&self, text: &str, source: FactSource) -> Vec<LearnOutcome> {
        let candidates = extract::extract_candidates(text);
        if candidates.is_empty() {
            debug!("no fact candidates in text");
            return Vec::new();
        }

        let mut last_span: HashMap<FactCategory, usize> = HashMap::new();
        for (index, candidate) in candidates.iter().enumerate() {
            if candidate.category.is_single_valued() {
                last_span.insert(candidate.category, index);
            }
        }

        let mut seen: HashSet<(FactCategory, String)> = HashSet::new();
        let mut outcomes = Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.into_iter().enumerate() {
            if candidate.category.is_single_valued()
                && last_span.get(&candidate.category) != Some(&index)
            {
                outcomes.push(LearnOutcome::Dropped {
                    candidate,
                    reason: "superseded later in the same text".into(),
                });
                continue;
            }
            if !candidate.category.is_single_valued()
                && !seen.insert((candidate.category, candidate.value.to_lowercase()))
            {
                outcomes.push(LearnOutcome::Dropped {
                    candidate,
                    reason: "duplicate within the same text".into(),
                });
                continue;
            }

            let value: String = candidate.value.chars().take(self.cfg.max_fact_len).collect();
            let cap = match candidate.category {
                FactCategory::Interest => self.cfg.max_interests,
                FactCategory::Note => self.cfg.max_notes,
                _ => 1,
            };
            match self
                .engine
                .store_fact(candidate.category, &value, source, candidate.confidence, cap)
                .await
            {
                Ok(FactWrite::Stored(fact)) => {
                    debug!(category = fact.category.as_str(), "fact stored");
                    outcomes.push(LearnOutcome::Stored(fact));
                }
                Ok(FactWrite::Duplicate) => outcomes.push(LearnOutcome::Dropped {
                    candidate,
                    reason: "already known".into(),
                }),
                Err(err) => {
                    warn!(error = %err, "fact not persisted");
                    outcomes.push(LearnOutcome::Dropped {
                        candidate,
                        reason: err.to_string(),
                    });
                }
            }
        }
        outcomes
    }

    /// Deterministic summary within the configured character budget.
    pub async fn summary(&self) -> Result<String> {
        self.summary_with_budget(self.cfg.summary_budget).await
    }

    /// Renders known facts as lines in priority order (name, location, age,
    /// interests, notes) and drops whole lowest-priority lines once the
    /// budget is reached. A value is never truncated mid-line.
    pub async fn summary_with_budget(&self, budget: usize) -> Result<String> {
        let facts = self.engine.facts().await?;
        Ok(render_summary(&facts, budget))
    }
}

fn render_summary(facts: &[Fact], budget: usize) -> String {
    let mut name = None;
    let mut location = None;
    let mut age = None;
    let mut interests = Vec::new();
    let mut notes = Vec::new();
    for fact in facts {
        match fact.category {
            FactCategory::Name => name = Some(fact.value.as_str()),
            FactCategory::Location => location = Some(fact.value.as_str()),
            FactCategory::Age => age = Some(fact.value.as_str()),
            FactCategory::Interest => interests.push(fact.value.as_str()),
            FactCategory::Note => notes.push(fact.value.as_str()),
        }
    }

    let mut lines: Vec<String> = Vec::new();
    if let Some(name) = name {
        lines.push(format!("Name: {name}"));
    }
    if let Some(location) = location {
        lines.push(format!("Wohnort: {location}"));
    }
    if let Some(age) = age {
        lines.push(format!("Alter: {age} Jahre"));
    }
    if !interests.is_empty() {
        lines.push(format!("Mag: {}", interests.join(", ")));
    }
    for note in notes {
        lines.push(format!("Notiz: {note}"));
    }

    let mut rendered = String::new();
    for line in lines {
        let needed = line.chars().count() + usize::from(!rendered.is_empty());
        if rendered.chars().count() + needed > budget {
            break;
        }
        if !rendered.is_empty() {
            rendered.push('\n');
        }
        rendered.push_str(&line);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(id: i64, category: FactCategory, value: &str) -> Fact {
        Fact {
            id,
            category,
            value: value.to_string(),
            session_id: None,
            message_id: None,
            confidence: Some(0.6),
            updated_at: 0,
        }
    }

    #[test]
    fn summary_orders_by_priority() {
        let facts = vec![
            fact(1, FactCategory::Interest, "Lesen"),
            fact(2, FactCategory::Name, "Anna"),
            fact(3, FactCategory::Location, "Berlin"),
            fact(4, FactCategory::Age, "29"),
            fact(5, FactCategory::Interest, "Wandern"),
            fact(6, FactCategory::Note, "trinkt keinen Kaffee"),
        ];
        assert_eq!(
            render_summary(&facts, 600),
            "Name: Anna\nWohnort: Berlin\nAlter: 29 Jahre\nMag: Lesen, Wandern\nNotiz: trinkt keinen Kaffee"
        );
    }

    #[test]
    fn over_budget_drops_whole_lines_lowest_priority_first() {
        let facts = vec![
            fact(1, FactCategory::Name, "Anna"),
            fact(2, FactCategory::Location, "Berlin"),
            fact(3, FactCategory::Note, "eine sehr lange Notiz die nicht mehr passt"),
        ];
        let rendered = render_summary(&facts, 26);
        assert_eq!(rendered, "Name: Anna\nWohnort: Berlin");
    }

    #[test]
    fn empty_store_renders_empty_summary() {
        assert_eq!(render_summary(&[], 600), "");
    }
}
