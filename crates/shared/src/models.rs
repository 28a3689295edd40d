//! Data models for the stream resolution pipeline.
//!
//! This module defines the structures that flow through the pipeline:
//! the incoming query, search candidates, confirmed series, download
//! mirrors and the final stream records.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An incoming stream request.
///
/// At least one title variant must be present; `episode_number` is
/// 1-based relative to the series the query resolves to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimeQuery {
    // Title variants
    pub title: Option<String>,
    pub english_title: Option<String>,
    pub japanese_title: Option<String>,

    // Episode selection
    pub episode_number: u32,

    // External cross-reference IDs, used for identity confirmation
    pub mal_id: Option<u32>,
    pub anilist_id: Option<u32>,
}

/// Validation failure for an incoming query.
///
/// Surfaced synchronously on submission; a rejected query never
/// creates a task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("at least one anime title must be provided")]
    MissingTitle,
    #[error("episode number must be a positive integer")]
    InvalidEpisode,
}

impl AnimeQuery {
    /// Check the query against the submission rules.
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.title_variants().is_empty() {
            return Err(QueryError::MissingTitle);
        }
        if self.episode_number == 0 {
            return Err(QueryError::InvalidEpisode);
        }
        Ok(())
    }

    /// All non-empty title variants, deduplicated, in declaration order.
    pub fn title_variants(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for title in [&self.title, &self.english_title, &self.japanese_title]
            .into_iter()
            .flatten()
        {
            let trimmed = title.trim();
            if !trimmed.is_empty() && !seen.iter().any(|t| t == trimmed) {
                seen.push(trimmed.to_string());
            }
        }
        seen
    }

    /// Whether the query carries any external cross-reference ID.
    pub fn has_external_ids(&self) -> bool {
        self.mal_id.is_some() || self.anilist_id.is_some()
    }
}

/// Similarity of one candidate title against the query's title variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Similarity {
    /// Maximum score over all compared title variants, in [0, 1].
    pub highest_score: f64,
    /// Individual score per compared title variant, for diagnostics.
    pub per_title: HashMap<String, f64>,
}

/// A search-result entry: a possible match for the requested series,
/// prior to identity confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// Source-local identifier for the series.
    pub session: String,
    pub title: String,
    #[serde(rename = "type")]
    pub media_type: Option<String>,
    pub episodes: Option<u32>,
    pub status: Option<String>,
    pub season: Option<String>,
    pub year: Option<u32>,
    pub poster: Option<String>,

    /// Attached once by the scoring stage, never rewritten.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub similarity: Option<Similarity>,
}

impl Candidate {
    /// Highest similarity score, or 0.0 before scoring.
    pub fn score(&self) -> f64 {
        self.similarity.as_ref().map_or(0.0, |s| s.highest_score)
    }
}

/// Full detail record for a confirmed series.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnimeDetail {
    pub genres: Vec<String>,
    pub synopsis: Option<String>,
    pub mal_id: Option<u32>,
    pub anilist_id: Option<u32>,
}

/// A candidate whose identity has been confirmed, plus its detail record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmedAnime {
    pub candidate: Candidate,
    pub detail: AnimeDetail,
}

/// One entry of a series' episode listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub episode: u32,
    /// Source-local session id of the episode's playback page.
    pub session: String,
}

/// The resolution stage a mirror's URL has reached.
///
/// Each pipeline stage advances the link rather than overwriting a
/// single field, so an unresolved mirror is distinguishable from a
/// resolved one by type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "url", rename_all = "snake_case")]
pub enum MirrorLink {
    /// The mirror page href as offered on the playback page.
    MirrorPage(String),
    /// The intermediary token page recovered from the mirror page.
    TokenPage(String),
    /// The final direct media URL.
    Media(String),
}

impl MirrorLink {
    pub fn url(&self) -> &str {
        match self {
            MirrorLink::MirrorPage(url) | MirrorLink::TokenPage(url) | MirrorLink::Media(url) => {
                url
            }
        }
    }
}

/// One offered download/stream option for an episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadMirror {
    /// Uploader/author label from the mirror entry.
    pub author: String,
    pub resolution: String,
    pub size: String,
    pub language: String,
    pub link: MirrorLink,
}

/// A fully resolved stream for one mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    pub author: String,
    pub url: String,
    pub resolution: String,
    pub size: String,
    pub language: String,
}

/// Aggregated result for one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStreams {
    pub source: String,
    pub streams: Vec<StreamRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(title: Option<&str>, english: Option<&str>, japanese: Option<&str>) -> AnimeQuery {
        AnimeQuery {
            title: title.map(String::from),
            english_title: english.map(String::from),
            japanese_title: japanese.map(String::from),
            episode_number: 1,
            mal_id: None,
            anilist_id: None,
        }
    }

    #[test]
    fn test_validate_requires_a_title() {
        let q = query(None, None, None);
        assert_eq!(q.validate(), Err(QueryError::MissingTitle));

        let q = query(Some("  "), None, None);
        assert_eq!(q.validate(), Err(QueryError::MissingTitle));

        let q = query(None, Some("Frieren"), None);
        assert!(q.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_positive_episode() {
        let mut q = query(Some("Frieren"), None, None);
        q.episode_number = 0;
        assert_eq!(q.validate(), Err(QueryError::InvalidEpisode));
    }

    #[test]
    fn test_title_variants_dedup_and_order() {
        let q = query(
            Some("Sousou no Frieren"),
            Some("Frieren: Beyond Journey's End"),
            Some("Sousou no Frieren"),
        );
        assert_eq!(
            q.title_variants(),
            vec![
                "Sousou no Frieren".to_string(),
                "Frieren: Beyond Journey's End".to_string(),
            ]
        );
    }

    #[test]
    fn test_mirror_link_url() {
        let link = MirrorLink::TokenPage("https://pahe.win/abc".to_string());
        assert_eq!(link.url(), "https://pahe.win/abc");
        assert_ne!(link, MirrorLink::Media("https://pahe.win/abc".to_string()));
    }
}
