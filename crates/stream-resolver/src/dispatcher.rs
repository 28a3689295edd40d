//! Source dispatcher.
//!
//! Fans one query out to every registered source concurrently. A
//! failing or aborting source is isolated: it is logged and
//! contributes an empty stream list, never taking the other sources
//! down with it.

use shared::models::{AnimeQuery, SourceStreams};
use std::sync::Arc;
use tracing::{error, info};

use crate::sources::StreamSource;

pub struct Dispatcher {
    sources: Vec<Arc<dyn StreamSource>>,
}

impl Dispatcher {
    pub fn new(sources: Vec<Arc<dyn StreamSource>>) -> Self {
        Self { sources }
    }

    /// Resolve the query against every source. Results come back in
    /// registration order, one entry per source.
    pub async fn find_streams(&self, query: &AnimeQuery) -> Vec<SourceStreams> {
        let lookups = self.sources.iter().map(|source| async move {
            let name = source.name().to_string();
            match source.resolve(query).await {
                Ok(Some(resolution)) => SourceStreams {
                    source: name,
                    streams: resolution.streams,
                },
                Ok(None) => SourceStreams {
                    source: name,
                    streams: Vec::new(),
                },
                Err(e) => {
                    error!(source = %name, error = %format!("{:#}", e), "Source resolution failed");
                    SourceStreams {
                        source: name,
                        streams: Vec::new(),
                    }
                }
            }
        });

        let results = futures::future::join_all(lookups).await;
        info!(
            sources = results.len(),
            streams = results.iter().map(|r| r.streams.len()).sum::<usize>(),
            "Dispatch complete"
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SourceResolution;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use shared::models::{
        AnimeDetail, Candidate, ConfirmedAnime, StreamRecord,
    };

    struct FixedSource {
        name: &'static str,
        streams: Vec<StreamRecord>,
    }

    #[async_trait]
    impl StreamSource for FixedSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn resolve(&self, _query: &AnimeQuery) -> Result<Option<SourceResolution>> {
            Ok(Some(SourceResolution {
                detail: ConfirmedAnime {
                    candidate: Candidate {
                        session: "s".to_string(),
                        title: "t".to_string(),
                        media_type: None,
                        episodes: None,
                        status: None,
                        season: None,
                        year: None,
                        poster: None,
                        similarity: None,
                    },
                    detail: AnimeDetail::default(),
                },
                streams: self.streams.clone(),
            }))
        }
    }

    struct FailingSource;

    #[async_trait]
    impl StreamSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        async fn resolve(&self, _query: &AnimeQuery) -> Result<Option<SourceResolution>> {
            Err(anyhow!("connection reset"))
        }
    }

    struct AbortingSource;

    #[async_trait]
    impl StreamSource for AbortingSource {
        fn name(&self) -> &str {
            "aborting"
        }

        async fn resolve(&self, _query: &AnimeQuery) -> Result<Option<SourceResolution>> {
            Ok(None)
        }
    }

    fn query() -> AnimeQuery {
        AnimeQuery {
            title: Some("Shangri-La Frontier".to_string()),
            english_title: None,
            japanese_title: None,
            episode_number: 3,
            mal_id: None,
            anilist_id: None,
        }
    }

    fn stream() -> StreamRecord {
        StreamRecord {
            author: "Kametsu".to_string(),
            url: "https://files.kwik.test/v720.mp4".to_string(),
            resolution: "720p".to_string(),
            size: "102MB".to_string(),
            language: "jpn".to_string(),
        }
    }

    #[tokio::test]
    async fn test_failing_source_does_not_poison_others() {
        let dispatcher = Dispatcher::new(vec![
            Arc::new(FailingSource),
            Arc::new(FixedSource {
                name: "working",
                streams: vec![stream()],
            }),
        ]);

        let results = dispatcher.find_streams(&query()).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].source, "failing");
        assert!(results[0].streams.is_empty());
        assert_eq!(results[1].source, "working");
        assert_eq!(results[1].streams.len(), 1);
    }

    #[tokio::test]
    async fn test_aborting_source_contributes_empty_result() {
        let dispatcher = Dispatcher::new(vec![Arc::new(AbortingSource)]);
        let results = dispatcher.find_streams(&query()).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].streams.is_empty());
    }

    #[tokio::test]
    async fn test_results_follow_registration_order() {
        let dispatcher = Dispatcher::new(vec![
            Arc::new(FixedSource {
                name: "first",
                streams: vec![],
            }),
            Arc::new(FixedSource {
                name: "second",
                streams: vec![stream()],
            }),
        ]);

        let results = dispatcher.find_streams(&query()).await;
        assert_eq!(results[0].source, "first");
        assert_eq!(results[1].source, "second");
    }
}
