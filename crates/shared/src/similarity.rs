//! Title similarity scoring.
//!
//! Compares a candidate title against every title variant of a query and
//! reports the best match plus a per-variant breakdown. The default
//! implementation is a term-frequency cosine similarity; anything honoring
//! the [`TitleScorer`] contract (e.g. an embedding backend) can be swapped
//! in without touching the pipeline.

use crate::models::Similarity;
use std::collections::HashMap;

/// Scoring contract used by the candidate resolvers.
///
/// Implementations must be deterministic, score in [0, 1], reward exact
/// and near-exact matches with values approaching 1, and score disjoint
/// vocabularies near 0. The scorer is built once at startup and shared
/// by reference.
pub trait TitleScorer: Send + Sync {
    /// Compare `candidate` against each reference independently and
    /// return the maximum as `highest_score`, retaining every
    /// individual score.
    fn score(&self, references: &[String], candidate: &str) -> Similarity;
}

/// Term-frequency cosine similarity over lowercase word tokens.
#[derive(Debug, Default)]
pub struct FreqVectorScorer;

impl FreqVectorScorer {
    pub fn new() -> Self {
        Self
    }
}

impl TitleScorer for FreqVectorScorer {
    fn score(&self, references: &[String], candidate: &str) -> Similarity {
        let candidate_vec = freq_vector(candidate);

        let mut per_title = HashMap::with_capacity(references.len());
        let mut highest_score: f64 = 0.0;

        for reference in references {
            let score = cosine(&freq_vector(reference), &candidate_vec);
            highest_score = highest_score.max(score);
            per_title.insert(reference.clone(), score);
        }

        Similarity {
            highest_score,
            per_title,
        }
    }
}

/// Word frequencies of a text, lowercased, punctuation ignored.
fn freq_vector(text: &str) -> HashMap<String, u32> {
    let mut freqs = HashMap::new();
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        *freqs.entry(word.to_string()).or_insert(0) += 1;
    }
    freqs
}

fn cosine(a: &HashMap<String, u32>, b: &HashMap<String, u32>) -> f64 {
    let dot: f64 = a
        .iter()
        .filter_map(|(word, &count)| b.get(word).map(|&other| f64::from(count) * f64::from(other)))
        .sum();

    let magnitude = |v: &HashMap<String, u32>| {
        v.values()
            .map(|&count| f64::from(count) * f64::from(count))
            .sum::<f64>()
            .sqrt()
    };

    let (mag_a, mag_b) = (magnitude(a), magnitude(b));
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(titles: &[&str]) -> Vec<String> {
        titles.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_exact_match_scores_one() {
        let scorer = FreqVectorScorer::new();
        let sim = scorer.score(&refs(&["Shangri-La Frontier"]), "Shangri-La Frontier");
        assert!((sim.highest_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_disjoint_vocabulary_scores_zero() {
        let scorer = FreqVectorScorer::new();
        let sim = scorer.score(&refs(&["Cowboy Bebop"]), "Shangri-La Frontier");
        assert_eq!(sim.highest_score, 0.0);
    }

    #[test]
    fn test_highest_is_max_over_references() {
        let scorer = FreqVectorScorer::new();
        let references = refs(&["Cowboy Bebop", "Shangri-La Frontier"]);
        let sim = scorer.score(&references, "Shangri-La Frontier Season 2");

        assert_eq!(sim.per_title.len(), 2);
        let best = sim
            .per_title
            .values()
            .cloned()
            .fold(0.0f64, f64::max);
        assert_eq!(sim.highest_score, best);
        assert!(sim.per_title["Shangri-La Frontier"] > sim.per_title["Cowboy Bebop"]);
    }

    #[test]
    fn test_empty_candidate_scores_zero() {
        let scorer = FreqVectorScorer::new();
        let sim = scorer.score(&refs(&["Cowboy Bebop"]), "");
        assert_eq!(sim.highest_score, 0.0);
    }

    #[test]
    fn test_deterministic() {
        let scorer = FreqVectorScorer::new();
        let references = refs(&["Attack on Titan", "Shingeki no Kyojin"]);
        let a = scorer.score(&references, "Attack on Titan Final Season");
        let b = scorer.score(&references, "Attack on Titan Final Season");
        assert_eq!(a.highest_score, b.highest_score);
        assert_eq!(a.per_title, b.per_title);
    }

    #[test]
    fn test_case_and_punctuation_insensitive() {
        let scorer = FreqVectorScorer::new();
        let sim = scorer.score(&refs(&["shangri la frontier"]), "Shangri-La Frontier!");
        assert!((sim.highest_score - 1.0).abs() < 1e-9);
    }
}
