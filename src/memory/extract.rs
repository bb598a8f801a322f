//! Pattern set turning free chat text into fact candidates.
//!
//! Two sources, two confidence tiers: explicit `[MERKEN: ...]` directive
//! spans the assistant emits on the user's behalf (0.95), and heuristic
//! first-person statements in German or English (0.6). Extraction never
//! errors; text that matches nothing yields an empty candidate list.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::store::FactCategory;

pub const DIRECTIVE_CONFIDENCE: f64 = 0.95;
pub const PATTERN_CONFIDENCE: f64 = 0.6;

/// A fact candidate in source order; the position ties last-write-wins
/// merging to where the span occurred in the text.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub category: FactCategory,
    pub value: String,
    pub confidence: f64,
}

struct FactPattern {
    category: FactCategory,
    regex: Lazy<Regex>,
}

macro_rules! fact_pattern {
    ($category:expr, $pattern:literal) => {
        FactPattern {
            category: $category,
            regex: Lazy::new(|| Regex::new($pattern).expect("static pattern")),
        }
    };
}

static PATTERNS: [FactPattern; 6] = [
    fact_pattern!(
        FactCategory::Name,
        r"(?i)\b(?:ich hei(?:ß|ss)e|mein name ist|my name is|call me)\s+([\p{L}]+(?:\s+[\p{L}]+)?)"
    ),
    fact_pattern!(
        FactCategory::Age,
        r"(?i)\bich bin\s+(\d{1,3})\s+jahre(?:\s+alt)?\b"
    ),
    fact_pattern!(
        FactCategory::Age,
        r"(?i)\bi(?:'m| am)\s+(\d{1,3})\s+years?(?:\s+old)?\b"
    ),
    fact_pattern!(
        FactCategory::Location,
        r"(?i)\b(?:ich (?:lebe|wohne) in|i live in|i(?:'m| am) from)\s+([^.,!?;\n]+)"
    ),
    fact_pattern!(
        FactCategory::Interest,
        r"(?i)\bich (?:mag|liebe)\s+([^.,!?;\n]+)"
    ),
    fact_pattern!(
        FactCategory::Interest,
        r"(?i)\bi (?:like|love)\s+([^.,!?;\n]+)"
    ),
];

static DIRECTIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[MERKEN:\s*([^\]]+)\]").expect("static pattern"));

// MERKEN stores a note, SUCHE requests a lookup; both are assistant-internal
// and must never reach the presentation layer.
static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(?:MERKEN|SUCHE):\s*[^\]]*\]").expect("static pattern"));

/// All candidates found in `text`, ordered by where their span starts.
pub fn extract_candidates(text: &str) -> Vec<Candidate> {
    let mut spans: Vec<(usize, Candidate)> = Vec::new();

    for captures in DIRECTIVE_RE.captures_iter(text) {
        if let (Some(whole), Some(group)) = (captures.get(0), captures.get(1)) {
            let value = normalize_value(group.as_str());
            if !value.is_empty() {
                spans.push((
                    whole.start(),
                    Candidate {
                        category: FactCategory::Note,
                        value,
                        confidence: DIRECTIVE_CONFIDENCE,
                    },
                ));
            }
        }
    }

    for pattern in &PATTERNS {
        for captures in pattern.regex.captures_iter(text) {
            if let (Some(whole), Some(group)) = (captures.get(0), captures.get(1)) {
                let raw = normalize_value(group.as_str());
                if raw.is_empty() {
                    continue;
                }
                let value = match pattern.category {
                    FactCategory::Name => capitalize_words(&raw),
                    _ => raw,
                };
                spans.push((
                    whole.start(),
                    Candidate {
                        category: pattern.category,
                        value,
                        confidence: PATTERN_CONFIDENCE,
                    },
                ));
            }
        }
    }

    spans.sort_by_key(|(start, _)| *start);
    spans.into_iter().map(|(_, candidate)| candidate).collect()
}

/// Removes `[MERKEN: ...]` and `[SUCHE: ...]` tags before text is shown.
pub fn strip_directive_tags(text: &str) -> String {
    let stripped = TAG_RE.replace_all(text, "");
    collapse_whitespace(stripped.trim())
}

/// Trims, collapses runs of whitespace, and drops trailing punctuation.
pub fn normalize_value(raw: &str) -> String {
    let collapsed = collapse_whitespace(raw.trim());
    collapsed
        .trim_end_matches(['.', ',', '!', '?', ';', ':'])
        .trim_end()
        .to_string()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn capitalize_words(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values_of(text: &str, category: FactCategory) -> Vec<String> {
        extract_candidates(text)
            .into_iter()
            .filter(|c| c.category == category)
            .map(|c| c.value)
            .collect()
    }

    #[test]
    fn german_name_statement_is_extracted_and_capitalized() {
        assert_eq!(
            values_of("hallo, ich heiße anna maria!", FactCategory::Name),
            vec!["Anna Maria"]
        );
        assert_eq!(
            values_of("Mein Name ist bernd.", FactCategory::Name),
            vec!["Bernd"]
        );
    }

    #[test]
    fn english_variants_match_the_same_categories() {
        assert_eq!(
            values_of("my name is Claire, I live in Dublin. I love hiking!", FactCategory::Name),
            vec!["Claire"]
        );
        assert_eq!(
            values_of("I live in Dublin.", FactCategory::Location),
            vec!["Dublin"]
        );
        assert_eq!(
            values_of("I am 34 years old.", FactCategory::Age),
            vec!["34"]
        );
        assert_eq!(
            values_of("I love hiking in the rain.", FactCategory::Interest),
            vec!["hiking in the rain"]
        );
    }

    #[test]
    fn candidates_come_back_in_source_order() {
        let candidates =
            extract_candidates("Ich heiße Anna. Ich wohne in Berlin. Ich heiße Bernd.");
        let names: Vec<&str> = candidates
            .iter()
            .filter(|c| c.category == FactCategory::Name)
            .map(|c| c.value.as_str())
            .collect();
        assert_eq!(names, vec!["Anna", "Bernd"]);
        assert_eq!(candidates.last().map(|c| c.value.as_str()), Some("Bernd"));
    }

    #[test]
    fn directive_spans_become_high_confidence_notes() {
        let candidates = extract_candidates("Alles klar! [MERKEN: Nutzer trinkt keinen Kaffee]");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].category, FactCategory::Note);
        assert_eq!(candidates[0].value, "Nutzer trinkt keinen Kaffee");
        assert_eq!(candidates[0].confidence, DIRECTIVE_CONFIDENCE);
    }

    #[test]
    fn tags_are_stripped_for_display() {
        assert_eq!(
            strip_directive_tags("Gern! [MERKEN: mag Tee] Bis später. [SUCHE: Wetter Berlin]"),
            "Gern! Bis später."
        );
        assert_eq!(strip_directive_tags("keine Tags hier"), "keine Tags hier");
    }

    #[test]
    fn unmatched_text_yields_no_candidates() {
        assert!(extract_candidates("Wie wird das Wetter morgen?").is_empty());
        assert!(extract_candidates("").is_empty());
    }

    #[test]
    fn age_requires_the_unit_word() {
        assert!(values_of("ich bin 29 jahre alt", FactCategory::Age) == vec!["29"]);
        assert!(values_of("ich bin müde", FactCategory::Age).is_empty());
        assert!(values_of("ich bin 29", FactCategory::Age).is_empty());
    }

    #[test]
    fn values_are_normalized() {
        assert_eq!(normalize_value("  Berlin   Mitte ,"), "Berlin Mitte");
        assert_eq!(normalize_value("...!"), "");
    }
}
