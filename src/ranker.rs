//! Similarity ranking over embedded candidates.
//!
//! Scoring is cosine similarity, optionally reshaped two ways:
//!
//! - **Session boost** — artifacts owned by the current session have their
//!   raw cosine score multiplied by a boost factor > 1 before sorting.
//!   The factor lives in `agent.session_boost` config (default
//!   [`DEFAULT_SESSION_BOOST`]); it is applied here and nowhere else.
//! - **Lexical override** — schema ranking forces a minimum score when the
//!   candidate's name lexically matches the query, so exact table-name
//!   hits dominate over semantic noise even at low cosine similarity.
//!
//! The sort is stable: for a fixed candidate set and query, ties keep
//! insertion order and results are deterministic.

use crate::embedding::cosine_similarity;

/// Default multiplier for same-session artifacts.
pub const DEFAULT_SESSION_BOOST: f64 = 1.2;

/// Score floor when a candidate name exactly matches a query token.
pub const EXACT_MATCH_FLOOR: f64 = 0.95;

/// Score floor when a candidate name and the query partially contain
/// each other.
pub const KEYWORD_MATCH_FLOOR: f64 = 0.8;

/// One scoring candidate. `vector: None` means the candidate is excluded
/// from ranking entirely (not scored as zero).
pub struct Candidate<M> {
    pub id: String,
    pub vector: Option<Vec<f32>>,
    /// Multiplier applied to the raw cosine score (session boost; 1.0 when
    /// not applicable).
    pub weight: f64,
    /// Minimum score enforced after weighting (lexical override).
    pub floor: Option<f64>,
    pub meta: M,
}

impl<M> Candidate<M> {
    pub fn new(id: impl Into<String>, vector: Option<Vec<f32>>, meta: M) -> Self {
        Self {
            id: id.into(),
            vector,
            weight: 1.0,
            floor: None,
            meta,
        }
    }
}

/// A scored candidate, ordered best first.
pub struct Ranked<M> {
    pub id: String,
    pub score: f64,
    pub meta: M,
}

/// Rank `candidates` against `query_vector`, returning at most `k`
/// entries, best first. Candidates without vectors are dropped.
pub fn rank<M>(query_vector: &[f32], candidates: Vec<Candidate<M>>, k: usize) -> Vec<Ranked<M>> {
    let mut scored: Vec<Ranked<M>> = candidates
        .into_iter()
        .filter_map(|c| {
            let vector = c.vector?;
            let mut score = cosine_similarity(query_vector, &vector) as f64 * c.weight;
            if let Some(floor) = c.floor {
                score = score.max(floor);
            }
            Some(Ranked {
                id: c.id,
                score,
                meta: c.meta,
            })
        })
        .collect();

    // Stable: equal scores keep candidate insertion order.
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    scored
}

/// Lexical override floor for a candidate name against a query.
///
/// Exact: the name equals one of the query's whitespace-separated tokens.
/// Partial: a query token and the name (or one of the name's
/// underscore-separated words) contain each other; tokens shorter than 2
/// characters never match.
pub fn lexical_floor(name: &str, query: &str) -> Option<f64> {
    let name_lower = name.to_lowercase();
    let tokens: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric() && c != '_').to_string())
        .filter(|t| !t.is_empty())
        .collect();

    if tokens.iter().any(|t| *t == name_lower) {
        return Some(EXACT_MATCH_FLOOR);
    }

    let name_words: Vec<&str> = name_lower.split('_').filter(|w| w.len() >= 2).collect();

    if tokens.iter().filter(|t| t.len() >= 2).any(|t| {
        name_lower.contains(t.as_str())
            || t.contains(name_lower.as_str())
            || name_words
                .iter()
                .any(|w| w.contains(t.as_str()) || t.contains(w))
    }) {
        return Some(KEYWORD_MATCH_FLOOR);
    }

    None
}
