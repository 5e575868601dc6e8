use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use types::{MemoryRecord, ScoredMemory};

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "i", "in", "is", "it", "me",
    "my", "of", "on", "or", "the", "to", "with",
];

/// Lower-cased alphanumeric terms with stopwords removed.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(str::to_lowercase)
        .filter(|term| !STOPWORDS.contains(&term.as_str()))
        .collect()
}

pub(crate) fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.is_empty() || left.len() != right.len() {
        return 0.0;
    }
    let mut dot = 0.0_f64;
    let mut left_norm = 0.0_f64;
    let mut right_norm = 0.0_f64;
    for (l, r) in left.iter().zip(right) {
        let (l, r) = (f64::from(*l), f64::from(*r));
        dot += l * r;
        left_norm += l * l;
        right_norm += r * r;
    }
    if left_norm <= f64::EPSILON || right_norm <= f64::EPSILON {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

/// Share of distinct query terms present in `content`, plus a small bonus
/// for repeated hits. Zero means no lexical overlap.
pub(crate) fn keyword_score(query_terms: &BTreeSet<String>, content: &str) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let content_terms = tokenize(content);
    let mut matched = 0_usize;
    let mut occurrences = 0_usize;
    for term in query_terms {
        let hits = content_terms.iter().filter(|candidate| *candidate == term).count();
        if hits > 0 {
            matched += 1;
            occurrences += hits;
        }
    }
    if matched == 0 {
        return 0.0;
    }
    let coverage = matched as f64 / query_terms.len() as f64;
    let density = (occurrences - matched) as f64 / (content_terms.len().max(1)) as f64;
    coverage + density.min(1.0) * 0.1
}

/// Ranks live records of `owner_id` by cosine similarity to `embedding`.
pub(crate) fn rank_by_vector<'a>(
    records: impl IntoIterator<Item = &'a MemoryRecord>,
    owner_id: &str,
    embedding: &[f32],
    limit: usize,
    now: DateTime<Utc>,
) -> Vec<ScoredMemory> {
    let scored = records
        .into_iter()
        .filter(|record| record.owner_id == owner_id && record.is_live(now))
        .map(|record| ScoredMemory {
            score: cosine_similarity(embedding, &record.embedding),
            record: record.clone(),
        })
        .collect();
    top_n(scored, limit)
}

/// Ranks live records of `owner_id` by lexical overlap with `query`,
/// dropping records with no overlap at all.
pub(crate) fn rank_by_keywords<'a>(
    records: impl IntoIterator<Item = &'a MemoryRecord>,
    owner_id: &str,
    query: &str,
    limit: usize,
    now: DateTime<Utc>,
) -> Vec<ScoredMemory> {
    let query_terms = tokenize(query).into_iter().collect::<BTreeSet<_>>();
    let scored = records
        .into_iter()
        .filter(|record| record.owner_id == owner_id && record.is_live(now))
        .filter_map(|record| {
            let score = keyword_score(&query_terms, &record.content);
            (score > 0.0).then(|| ScoredMemory {
                score,
                record: record.clone(),
            })
        })
        .collect();
    top_n(scored, limit)
}

fn top_n(mut scored: Vec<ScoredMemory>, limit: usize) -> Vec<ScoredMemory> {
    scored.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| right.record.created_at.cmp(&left.record.created_at))
            .then_with(|| left.record.record_id.cmp(&right.record.record_id))
    });
    scored.truncate(limit);
    scored
}
