//! animepahe candidate resolver.
//!
//! Resolution runs as a fixed stage sequence: search every title
//! variant, dedupe and score the merged candidates, filter by the
//! adaptive mean threshold, confirm series identity, locate the
//! requested episode in the ascending listing, extract the download
//! mirrors from the playback page, then follow each mirror through its
//! redirect layer to the direct media URL. Any expected dead end
//! aborts with a typed [`ResolveAbort`]; the dispatcher turns that
//! into an empty result for this source.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;
use shared::config::{AnimepaheConfig, FetchConfig};
use shared::models::{
    AnimeDetail, AnimeQuery, Candidate, ConfirmedAnime, DownloadMirror, EpisodeRecord, MirrorLink,
    StreamRecord,
};
use shared::similarity::TitleScorer;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ResolveAbort, SourceResolution, StreamSource};
use crate::fetch::{FetchHeaders, Fetcher};
use crate::render::{FormSubmission, RenderedFetch};

/// Mirror entry label: `<author> · <resolution> (<size>)`, possibly
/// followed by a badge suffix.
static MIRROR_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<author>.+?)\s*·\s*(?P<resolution>[^\s(]+)\s*\((?P<size>[^)]+)\)")
        .expect("mirror label pattern")
});

/// Script blocks of an HTML body.
static SCRIPT_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<script[^>]*>(.*?)</script>").expect("script block pattern"));

/// An href assignment to an absolute URL inside script text.
static HREF_ASSIGN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"href\s*=\s*["'](https?://[^"']+)["']"#).expect("href assignment pattern")
});

/// Search API payload.
#[derive(Debug, Deserialize)]
struct SearchPayload {
    #[serde(default)]
    data: Vec<Candidate>,
}

/// Episode listing page, sorted ascending by episode number.
#[derive(Debug, Deserialize)]
struct ReleasePayload {
    current_page: u32,
    last_page: u32,
    #[serde(default)]
    data: Vec<EpisodeRecord>,
}

/// Candidate resolver for animepahe.
pub struct AnimePahe {
    base_url: String,
    headers: FetchHeaders,
    fetcher: Arc<dyn Fetcher>,
    renderer: Arc<dyn RenderedFetch>,
    scorer: Arc<dyn TitleScorer>,
    raw_retries: u32,
    rendered_retries: u32,
    wait_timeout: Duration,
}

impl AnimePahe {
    pub fn new(
        config: &AnimepaheConfig,
        fetch: &FetchConfig,
        fetcher: Arc<dyn Fetcher>,
        renderer: Arc<dyn RenderedFetch>,
        scorer: Arc<dyn TitleScorer>,
    ) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            headers: FetchHeaders {
                cookie: config.cookie.clone(),
            },
            fetcher,
            renderer,
            scorer,
            raw_retries: fetch.raw_max_retries,
            rendered_retries: fetch.rendered_max_retries,
            wait_timeout: Duration::from_secs(fetch.timeout_secs),
        }
    }

    /// Stage 1: fetch every title variant's search results and merge
    /// them, deduplicated by session, first occurrence wins.
    async fn search(&self, query: &AnimeQuery) -> Result<Vec<Candidate>> {
        let urls: Vec<String> = query
            .title_variants()
            .iter()
            .map(|title| {
                format!(
                    "{}/api?m=search&q={}",
                    self.base_url,
                    urlencoding::encode(title)
                )
            })
            .collect();

        let pages = self
            .fetcher
            .fetch_batch(&urls, &self.headers, self.raw_retries)
            .await;

        let mut lists = Vec::with_capacity(pages.len());
        for page in pages {
            match serde_json::from_str::<SearchPayload>(&page.body) {
                Ok(payload) => lists.push(payload.data),
                Err(e) => {
                    warn!(url = %page.url, error = %e, "Malformed search payload, skipping");
                }
            }
        }

        let merged = merge_candidates(lists);
        if merged.is_empty() {
            return Err(ResolveAbort::NoCandidates.into());
        }
        Ok(merged)
    }

    /// Stage 2: attach a similarity score to every candidate.
    fn score(&self, query: &AnimeQuery, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        let references = query.title_variants();
        for candidate in &mut candidates {
            candidate.similarity = Some(self.scorer.score(&references, &candidate.title));
        }
        candidates
    }

    /// Stage 4: settle on one candidate and fetch its detail record.
    ///
    /// With external IDs the detail records decide; without them the
    /// highest-similarity candidate wins.
    async fn confirm(&self, query: &AnimeQuery, candidates: Vec<Candidate>) -> Result<ConfirmedAnime> {
        if query.has_external_ids() {
            let urls: Vec<String> = candidates
                .iter()
                .map(|c| self.detail_url(&c.session))
                .collect();
            let pages = self
                .fetcher
                .fetch_batch(&urls, &self.headers, self.raw_retries)
                .await;

            for candidate in candidates {
                let url = self.detail_url(&candidate.session);
                let Some(page) = pages.iter().find(|p| p.url == url) else {
                    continue;
                };
                let detail = match parse_detail(&page.body) {
                    Ok(detail) => detail,
                    Err(e) => {
                        warn!(url = %url, error = %e, "Unparseable detail page, skipping candidate");
                        continue;
                    }
                };
                if external_ids_match(query, &detail) {
                    info!(
                        session = %candidate.session,
                        title = %candidate.title,
                        "Identity confirmed via external IDs"
                    );
                    return Ok(ConfirmedAnime { candidate, detail });
                }
            }
            return Err(ResolveAbort::NotFound.into());
        }

        // No external IDs: take the best-scoring survivor.
        let candidate = candidates
            .into_iter()
            .max_by(|a, b| a.score().partial_cmp(&b.score()).unwrap_or(Ordering::Equal))
            .ok_or(ResolveAbort::NoCandidates)?;

        let url = self.detail_url(&candidate.session);
        let pages = self
            .fetcher
            .fetch_batch(&[url.clone()], &self.headers, self.raw_retries)
            .await;
        let detail = pages
            .first()
            .and_then(|page| match parse_detail(&page.body) {
                Ok(detail) => Some(detail),
                Err(e) => {
                    warn!(url = %url, error = %e, "Unparseable detail page");
                    None
                }
            })
            .unwrap_or_default();

        info!(
            session = %candidate.session,
            title = %candidate.title,
            score = candidate.score(),
            "Identity confirmed by similarity"
        );
        Ok(ConfirmedAnime { candidate, detail })
    }

    /// Stage 5: walk the ascending episode listing page by page until
    /// the computed target episode appears.
    async fn locate_episode(&self, query: &AnimeQuery, session: &str) -> Result<EpisodeRecord> {
        let mut page_number = 1u32;
        let mut target = None;

        loop {
            let url = format!(
                "{}/api?m=release&id={}&sort=episode_asc&page={}",
                self.base_url, session, page_number
            );
            let pages = self
                .fetcher
                .fetch_batch(&[url.clone()], &self.headers, self.raw_retries)
                .await;
            let body = pages
                .into_iter()
                .next()
                .with_context(|| format!("Episode listing unavailable: {}", url))?;

            let payload: ReleasePayload = serde_json::from_str(&body.body)
                .with_context(|| format!("Malformed episode listing: {}", url))?;

            // The first entry of the first page anchors the numbering;
            // sequels often do not start at episode 1.
            if target.is_none() {
                let base = payload
                    .data
                    .first()
                    .map(|e| e.episode)
                    .ok_or(ResolveAbort::NoEpisodeMatch(query.episode_number))?;
                let computed = target_episode(base, query.episode_number);
                debug!(base_episode = base, target_episode = computed, "Episode numbering anchored");
                target = Some(computed);
            }
            let wanted = target.unwrap_or(query.episode_number);

            if let Some(record) = payload.data.iter().find(|e| e.episode == wanted) {
                return Ok(record.clone());
            }

            if payload.current_page >= payload.last_page {
                return Err(ResolveAbort::NoEpisodeMatch(wanted).into());
            }
            page_number += 1;
        }
    }

    /// Stage 6: render the playback page and parse its download
    /// mirrors.
    async fn extract_mirrors(
        &self,
        anime_session: &str,
        episode: &EpisodeRecord,
    ) -> Result<Vec<DownloadMirror>> {
        let url = format!("{}/play/{}/{}", self.base_url, anime_session, episode.session);
        let mut page = self
            .renderer
            .open(&url, &self.headers, self.rendered_retries)
            .await
            .with_context(|| format!("Failed to open playback page: {}", url))?;

        page.wait_for("#pickDownload", self.wait_timeout)
            .await
            .context("Download options never appeared")?;

        let mut mirrors = Vec::new();
        for anchor in page.select("#pickDownload a")? {
            let Some(href) = anchor.attr("href") else {
                continue;
            };
            match parse_mirror_label(&anchor.text) {
                Some((author, resolution, size)) => mirrors.push(DownloadMirror {
                    author,
                    resolution,
                    size,
                    language: anchor.badge.clone().unwrap_or_else(|| "jpn".to_string()),
                    link: MirrorLink::MirrorPage(href.to_string()),
                }),
                None => {
                    warn!(label = %anchor.text, "Unrecognized mirror label, skipping");
                }
            }
        }

        if mirrors.is_empty() {
            return Err(ResolveAbort::NoMirrors.into());
        }
        Ok(mirrors)
    }

    /// Stage 7: advance each mirror past its landing page by scanning
    /// the page's script text for the redirect target.
    async fn resolve_redirects(&self, mirrors: Vec<DownloadMirror>) -> Vec<DownloadMirror> {
        let urls: Vec<String> = mirrors
            .iter()
            .map(|mirror| mirror.link.url().to_string())
            .collect();
        let pages = self
            .fetcher
            .fetch_batch(&urls, &self.headers, self.raw_retries)
            .await;

        mirrors
            .into_iter()
            .map(|mut mirror| {
                let MirrorLink::MirrorPage(url) = &mirror.link else {
                    return mirror;
                };
                match pages.iter().find(|p| &p.url == url) {
                    Some(page) => match extract_redirect_target(&page.body) {
                        Some(target) => mirror.link = MirrorLink::TokenPage(target),
                        None => {
                            warn!(url = %url, "No redirect target on mirror page, keeping mirror link");
                        }
                    },
                    None => {
                        warn!(url = %url, "Mirror page unreachable, keeping mirror link");
                    }
                }
                mirror
            })
            .collect()
    }

    /// Stage 8: submit each token page's form and read the final media
    /// URL from the redirect Location. Mirrors resolve concurrently
    /// and fail independently.
    async fn resolve_final(&self, mirrors: Vec<DownloadMirror>) -> Vec<StreamRecord> {
        let resolutions = mirrors.into_iter().map(|mirror| async move {
            match self.resolve_mirror(&mirror).await {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(
                        author = %mirror.author,
                        resolution = %mirror.resolution,
                        error = %format!("{:#}", e),
                        "Mirror dropped"
                    );
                    None
                }
            }
        });

        futures::future::join_all(resolutions)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn resolve_mirror(&self, mirror: &DownloadMirror) -> Result<StreamRecord> {
        let MirrorLink::TokenPage(url) = &mirror.link else {
            return Err(anyhow!("mirror never advanced past its landing page"));
        };

        let mut page = self
            .renderer
            .open(url, &self.headers, self.rendered_retries)
            .await
            .with_context(|| format!("Failed to open token page: {}", url))?;

        page.wait_for("form", self.wait_timeout)
            .await
            .context("Download form never appeared")?;

        let form = page
            .select("form")?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("download form missing"))?;
        let action = form
            .attr("action")
            .ok_or_else(|| anyhow!("download form has no action"))?
            .to_string();

        let token = page
            .select("input[name=_token]")?
            .into_iter()
            .next()
            .and_then(|input| input.attr("value").map(String::from))
            .ok_or_else(|| anyhow!("anti-forgery token missing"))?;

        let outcome = page
            .submit_form(FormSubmission {
                action,
                fields: vec![("_token".to_string(), token)],
                cookies: page.cookies(),
            })
            .await?;

        let location = outcome
            .location
            .ok_or_else(|| anyhow!("no Location header in form response ({})", outcome.status))?;

        Ok(StreamRecord {
            author: mirror.author.clone(),
            url: location,
            resolution: mirror.resolution.clone(),
            size: mirror.size.clone(),
            language: mirror.language.clone(),
        })
    }

    async fn run_pipeline(&self, query: &AnimeQuery) -> Result<SourceResolution> {
        let candidates = self.search(query).await?;
        debug!(candidates = candidates.len(), "Search complete");

        let scored = self.score(query, candidates);
        let filtered = filter_by_mean(scored);
        debug!(candidates = filtered.len(), "Filtered by mean similarity");

        let confirmed = self.confirm(query, filtered).await?;
        let episode = self
            .locate_episode(query, &confirmed.candidate.session)
            .await?;
        info!(episode = episode.episode, session = %episode.session, "Episode located");

        let mirrors = self
            .extract_mirrors(&confirmed.candidate.session, &episode)
            .await?;
        info!(mirrors = mirrors.len(), "Mirrors extracted");

        let advanced = self.resolve_redirects(mirrors).await;
        let streams = self.resolve_final(advanced).await;
        if streams.is_empty() {
            return Err(ResolveAbort::NoMirrors.into());
        }

        Ok(SourceResolution {
            detail: confirmed,
            streams,
        })
    }

    fn detail_url(&self, session: &str) -> String {
        format!("{}/anime/{}", self.base_url, session)
    }
}

#[async_trait]
impl StreamSource for AnimePahe {
    fn name(&self) -> &str {
        "animepahe"
    }

    async fn resolve(&self, query: &AnimeQuery) -> Result<Option<SourceResolution>> {
        match self.run_pipeline(query).await {
            Ok(resolution) => {
                info!(
                    source = self.name(),
                    title = %resolution.detail.candidate.title,
                    streams = resolution.streams.len(),
                    "Resolution complete"
                );
                Ok(Some(resolution))
            }
            Err(e) => match e.downcast_ref::<ResolveAbort>() {
                Some(abort) => {
                    info!(source = self.name(), reason = %abort, "Resolution aborted");
                    Ok(None)
                }
                None => Err(e),
            },
        }
    }
}

/// Merge per-title search result lists, deduplicating by session.
/// The first occurrence wins.
fn merge_candidates(lists: Vec<Vec<Candidate>>) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for candidate in lists.into_iter().flatten() {
        if seen.insert(candidate.session.clone()) {
            merged.push(candidate);
        }
    }
    merged
}

/// Retain candidates scoring at least the arithmetic mean of all
/// highest scores. A lone candidate always survives.
fn filter_by_mean(candidates: Vec<Candidate>) -> Vec<Candidate> {
    if candidates.is_empty() {
        return candidates;
    }
    let mean = candidates.iter().map(Candidate::score).sum::<f64>() / candidates.len() as f64;
    candidates
        .into_iter()
        .filter(|c| c.score() >= mean)
        .collect()
}

/// Absolute episode number to look for, anchored at the listing's
/// first episode. Sequels often number from where the previous season
/// stopped.
fn target_episode(base_episode: u32, requested: u32) -> u32 {
    base_episode + requested - 1
}

/// Parse a mirror entry label of the form
/// `<author> · <resolution> (<size>)`.
fn parse_mirror_label(label: &str) -> Option<(String, String, String)> {
    let captures = MIRROR_LABEL.captures(label.trim())?;
    Some((
        captures["author"].trim().to_string(),
        captures["resolution"].trim().to_string(),
        captures["size"].trim().to_string(),
    ))
}

/// First absolute URL assigned to an href inside the body's script
/// blocks.
fn extract_redirect_target(body: &str) -> Option<String> {
    for script in SCRIPT_BLOCK.captures_iter(body) {
        if let Some(captures) = HREF_ASSIGN.captures(&script[1]) {
            return Some(captures[1].to_string());
        }
    }
    None
}

/// Scrape the series detail page: genres, synopsis and the external
/// cross-reference IDs linked from it.
fn parse_detail(body: &str) -> Result<AnimeDetail> {
    let genre_selector = Selector::parse("div.anime-genre a")
        .map_err(|e| anyhow!("genre selector: {}", e))?;
    let synopsis_selector = Selector::parse("div.anime-synopsis")
        .map_err(|e| anyhow!("synopsis selector: {}", e))?;
    let link_selector = Selector::parse("a[href]").map_err(|e| anyhow!("link selector: {}", e))?;

    let document = Html::parse_document(body);

    let genres = document
        .select(&genre_selector)
        .map(|a| {
            a.value()
                .attr("title")
                .map(String::from)
                .unwrap_or_else(|| a.text().collect::<String>().trim().to_string())
        })
        .filter(|g| !g.is_empty())
        .collect();

    let synopsis = document
        .select(&synopsis_selector)
        .next()
        .map(|div| div.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty());

    let mut mal_id = None;
    let mut anilist_id = None;
    for link in document.select(&link_selector) {
        let href = link.value().attr("href").unwrap_or_default();
        if href.contains("myanimelist.net/anime/") {
            mal_id = mal_id.or_else(|| trailing_id(href));
        } else if href.contains("anilist.co/anime/") {
            anilist_id = anilist_id.or_else(|| trailing_id(href));
        }
    }

    Ok(AnimeDetail {
        genres,
        synopsis,
        mal_id,
        anilist_id,
    })
}

/// Supplied external IDs must each match the detail record exactly.
fn external_ids_match(query: &AnimeQuery, detail: &AnimeDetail) -> bool {
    if let Some(mal_id) = query.mal_id {
        if detail.mal_id != Some(mal_id) {
            return false;
        }
    }
    if let Some(anilist_id) = query.anilist_id {
        if detail.anilist_id != Some(anilist_id) {
            return false;
        }
    }
    true
}

fn trailing_id(url: &str) -> Option<u32> {
    url.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}
