//! Rendered-fetch capability: script-driven page interaction.
//!
//! The mirror-extraction and final-resolution stages need more than a
//! body string: waiting for an element to be present, querying the DOM,
//! harvesting cookies and submitting a form without following the
//! redirect. [`RenderedFetch`] captures exactly that surface, so a
//! headless browser or an equivalent scriptable HTTP client can back it
//! interchangeably. [`StaticRenderer`] is the plain-HTTP implementation
//! used by default; it covers pages whose markup is server-rendered.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{redirect, Client, Url};
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::fetch::FetchHeaders;

/// A DOM element extracted from a rendered page.
#[derive(Debug, Clone)]
pub struct PageElement {
    /// Concatenated text content, whitespace-trimmed.
    pub text: String,
    /// Attribute map (href, value, name, ...).
    pub attrs: HashMap<String, String>,
    /// Text of a nested badge element, when present.
    pub badge: Option<String>,
}

impl PageElement {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// A form POST to perform against the page's session.
#[derive(Debug, Clone)]
pub struct FormSubmission {
    pub action: String,
    pub fields: Vec<(String, String)>,
    /// Cookie header value harvested from the page session.
    pub cookies: String,
}

/// Outcome of a form submission performed without following redirects.
#[derive(Debug, Clone)]
pub struct FormOutcome {
    pub status: u16,
    pub location: Option<String>,
}

/// One loaded page with its cookie session.
#[async_trait]
pub trait RenderedPage: Send {
    /// Wait until `selector` matches something on the page.
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<()>;

    /// All elements currently matching `selector`.
    fn select(&self, selector: &str) -> Result<Vec<PageElement>>;

    /// The page session's current cookies as a Cookie header value.
    fn cookies(&self) -> String;

    /// POST a form using the page's cookies, without following the
    /// redirect response.
    async fn submit_form(&self, submission: FormSubmission) -> Result<FormOutcome>;
}

/// Script-executing fetch contract (rendered mode).
#[async_trait]
pub trait RenderedFetch: Send + Sync {
    async fn open(
        &self,
        url: &str,
        headers: &FetchHeaders,
        max_retries: u32,
    ) -> Result<Box<dyn RenderedPage>>;
}

/// Plain-HTTP implementation of [`RenderedFetch`].
///
/// "Waiting" for an element is a bounded re-fetch poll; cookies are
/// tracked in a per-page jar seeded from the shared headers.
pub struct StaticRenderer {
    timeout: Duration,
    poll_interval: Duration,
}

impl StaticRenderer {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

#[async_trait]
impl RenderedFetch for StaticRenderer {
    async fn open(
        &self,
        url: &str,
        headers: &FetchHeaders,
        max_retries: u32,
    ) -> Result<Box<dyn RenderedPage>> {
        let parsed = Url::parse(url).with_context(|| format!("Invalid page URL: {}", url))?;

        let jar = Arc::new(Jar::default());
        for pair in headers.cookie.split(';') {
            let pair = pair.trim();
            if !pair.is_empty() {
                jar.add_cookie_str(pair, &parsed);
            }
        }

        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("stream-resolver/", env!("CARGO_PKG_VERSION")))
            .cookie_provider(jar.clone())
            .build()
            .context("Failed to create HTTP client")?;

        // The form POST sends the harvested cookies explicitly, so this
        // client carries no jar of its own.
        let no_redirect = Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("stream-resolver/", env!("CARGO_PKG_VERSION")))
            .redirect(redirect::Policy::none())
            .build()
            .context("Failed to create HTTP client")?;

        let mut last_err = None;
        for attempt in 0..=max_retries {
            match client.get(parsed.clone()).send().await {
                Ok(response) if response.status().is_success() => {
                    let body = response
                        .text()
                        .await
                        .with_context(|| format!("Failed to read page body: {}", url))?;
                    return Ok(Box::new(StaticPage {
                        url: parsed,
                        body,
                        client,
                        no_redirect,
                        jar,
                        poll_interval: self.poll_interval,
                    }));
                }
                Ok(response) => {
                    last_err = Some(anyhow!("Page load returned {}: {}", response.status(), url));
                }
                Err(e) => {
                    last_err = Some(anyhow!("Page load failed: {}", e));
                }
            }
            if attempt < max_retries {
                sleep(self.poll_interval * 2u32.pow(attempt)).await;
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Page load failed: {}", url)))
    }
}

struct StaticPage {
    url: Url,
    body: String,
    client: Client,
    no_redirect: Client,
    jar: Arc<Jar>,
    poll_interval: Duration,
}

/// Parse `body` and collect the elements matching `selector`.
///
/// Kept synchronous so the non-Send parsed DOM never lives across an
/// await point.
fn select_in(body: &str, selector: &str) -> Result<Vec<PageElement>> {
    let parsed =
        Selector::parse(selector).map_err(|e| anyhow!("Invalid selector {:?}: {}", selector, e))?;
    let badge_selector = Selector::parse("span").expect("static selector");

    let document = Html::parse_document(body);
    let mut elements = Vec::new();
    for element in document.select(&parsed) {
        let attrs = element
            .value()
            .attrs()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();

        let badge = element
            .select(&badge_selector)
            .next()
            .map(|span| span.text().collect::<String>().trim().to_string())
            .filter(|text| !text.is_empty());

        elements.push(PageElement {
            text: element.text().collect::<String>().trim().to_string(),
            attrs,
            badge,
        });
    }
    Ok(elements)
}

#[async_trait]
impl RenderedPage for StaticPage {
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if !select_in(&self.body, selector)?.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!(
                    "Timed out waiting for {:?} on {}",
                    selector,
                    self.url
                ));
            }

            // Static markup will not change on its own; re-fetch.
            sleep(self.poll_interval).await;
            debug!(url = %self.url, selector = selector, "Element not present, re-fetching");
            let response = self.client.get(self.url.clone()).send().await?;
            self.body = response.text().await?;
        }
    }

    fn select(&self, selector: &str) -> Result<Vec<PageElement>> {
        select_in(&self.body, selector)
    }

    fn cookies(&self) -> String {
        self.jar
            .cookies(&self.url)
            .and_then(|value| value.to_str().map(String::from).ok())
            .unwrap_or_default()
    }

    async fn submit_form(&self, submission: FormSubmission) -> Result<FormOutcome> {
        let action = Url::parse(&submission.action)
            .or_else(|_| self.url.join(&submission.action))
            .with_context(|| format!("Invalid form action: {}", submission.action))?;

        let mut request = self
            .no_redirect
            .post(action)
            .header(reqwest::header::REFERER, self.url.as_str())
            .form(&submission.fields);
        if !submission.cookies.is_empty() {
            request = request.header(reqwest::header::COOKIE, submission.cookies.clone());
        }

        let response = request.send().await.context("Form submission failed")?;

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(String::from);

        Ok(FormOutcome {
            status: response.status().as_u16(),
            location,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAY_PAGE: &str = r##"
        <html><body>
          <div id="pickDownload">
            <a href="https://pahe.win/abc" class="dropdown-item">Kametsu &middot; 720p (102MB)</a>
            <a href="https://pahe.win/def" class="dropdown-item">Kametsu &middot; 1080p (188MB) <span class="badge">eng</span></a>
          </div>
        </body></html>"##;

    #[test]
    fn test_select_extracts_text_attrs_and_badge() {
        let elements = select_in(PLAY_PAGE, "#pickDownload a").unwrap();
        assert_eq!(elements.len(), 2);

        assert_eq!(elements[0].attr("href"), Some("https://pahe.win/abc"));
        assert!(elements[0].text.contains("720p"));
        assert_eq!(elements[0].badge, None);

        assert_eq!(elements[1].badge.as_deref(), Some("eng"));
    }

    #[test]
    fn test_select_rejects_invalid_selector() {
        assert!(select_in(PLAY_PAGE, "[[[").is_err());
    }

    #[test]
    fn test_select_missing_element_is_empty() {
        let elements = select_in(PLAY_PAGE, "form").unwrap();
        assert!(elements.is_empty());
    }
}
