// src/fetch.rs

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;

use crate::{
    error::{ConfigurationError, ExternalServiceError},
    llm::transport_error,
};

/// Raw response of a page fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub status: u16,
    pub body: String,
}

/// HTTP fetch capability. Implementations must not retry; callers do.
#[async_trait]
pub trait PageFetcher: Send + Sync + Debug {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, ExternalServiceError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, ConfigurationError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ruleflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigurationError::Setting {
                key: "FETCH_TIMEOUT_SECS".into(),
                message: format!("could not build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    #[tracing::instrument(name = "http_fetch", skip(self))]
    async fn fetch(&self, url: &str) -> Result<FetchedPage, ExternalServiceError> {
        let resp = self.client.get(url).send().await.map_err(|e| transport_error("fetch", &e))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| transport_error("fetch", &e))?;
        Ok(FetchedPage { status, body })
    }
}

static DROPPED_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style|noscript|template)\b.*?</(script|style|noscript|template)\s*>")
        .expect("block pattern compiles")
});
static COMMENTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("comment pattern compiles"));
static BREAKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<\s*(br|/p|/div|/li|/h[1-6]|/tr|/article|/section)\b[^>]*>").expect("break pattern compiles")
});
static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag pattern compiles"));
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\r\f\v]+").expect("space pattern compiles"));
static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n+").expect("newline pattern compiles"));

/// Visible text of an HTML document.
pub fn html_to_text(html: &str) -> String {
    let text = DROPPED_BLOCKS.replace_all(html, " ");
    let text = COMMENTS.replace_all(&text, " ");
    let text = BREAKS.replace_all(&text, "\n");
    let text = TAGS.replace_all(&text, " ");
    let text = decode_entities(&text);
    let text = SPACES.replace_all(&text, " ");
    let text = BLANK_LINES.replace_all(&text, "\n");
    text.lines().map(str::trim).filter(|l| !l.is_empty()).collect::<Vec<_>>().join("\n")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
