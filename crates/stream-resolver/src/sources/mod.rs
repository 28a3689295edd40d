//! Per-source candidate resolvers.
//!
//! A source adapter turns an [`AnimeQuery`] into resolved stream
//! records for its site, or nothing when the site has no usable match.

pub mod animepahe;

use anyhow::Result;
use async_trait::async_trait;
use shared::models::{AnimeQuery, ConfirmedAnime, StreamRecord};

pub use animepahe::AnimePahe;

/// Successful outcome of one source's resolution.
#[derive(Debug, Clone)]
pub struct SourceResolution {
    /// The series the source settled on, with its detail record.
    pub detail: ConfirmedAnime,
    /// One record per mirror that resolved to a direct media URL.
    pub streams: Vec<StreamRecord>,
}

/// Adapter interface implemented by each candidate resolver.
#[async_trait]
pub trait StreamSource: Send + Sync {
    fn name(&self) -> &str;

    /// Resolve the query against this source.
    ///
    /// Returns `Ok(None)` when the source has no match (no candidates,
    /// no episode, failed identity confirmation); errors only on
    /// unrecoverable internal failure.
    async fn resolve(&self, query: &AnimeQuery) -> Result<Option<SourceResolution>>;
}

/// Expected reasons a resolution run stops early.
///
/// These surface as an empty result for the source, never as a fatal
/// error for the whole request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveAbort {
    #[error("search returned no candidates")]
    NoCandidates,
    #[error("no candidate matched the supplied external IDs")]
    NotFound,
    #[error("episode {0} not present in the episode listing")]
    NoEpisodeMatch(u32),
    #[error("no download mirrors could be resolved")]
    NoMirrors,
}
