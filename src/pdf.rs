//! Linked-document pipeline: download a PDF referenced by a page and turn it
//! into plain text.
//!
//! Failures never escape this module. They come back as `Error: ...` marker
//! strings that are stored in the step payload next to the primary value.

use std::time::Duration;

use async_trait::async_trait;
use lopdf::Document;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, COOKIE, USER_AGENT};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{DEFAULT_ACCEPT_LANGUAGE, DEFAULT_USER_AGENT, PDF_DOWNLOAD_TIMEOUT_MS};
use crate::driver::{Cookie, Page};
use crate::error::PdfError;

pub const PDF_EXTENSION: &str = ".pdf";
pub const PAGE_SEPARATOR: &str = "\n--- Page Separator ---\n";
pub const NO_TEXT: &str = "(No text extracted from PDF)";

const ACCEPT_DOCUMENTS: &str = "application/pdf,text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7";
const ERROR_BODY_EXCERPT: usize = 500;

pub fn download_timeout() -> Duration {
    Duration::from_millis(PDF_DOWNLOAD_TIMEOUT_MS)
}

/// Case-insensitive check on the absolute URL.
pub fn is_pdf_url(url: &str) -> bool {
    url.to_ascii_lowercase().ends_with(PDF_EXTENSION)
}

/// Joins `href` against the document URL. Unjoinable input is returned as-is.
pub fn resolve_url(base: &str, href: &str) -> String {
    match Url::parse(base).and_then(|base| base.join(href)) {
        Ok(url) => url.to_string(),
        Err(err) => {
            warn!(base, href, error = %err, "could not resolve link against page URL");
            href.to_string()
        }
    }
}

/// Fetches linked documents with the session's cookies.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    /// `None` on any failure: transport, non-2xx status or empty body.
    async fn fetch(&self, page: &dyn Page, url: &str, timeout: Duration) -> Option<Vec<u8>>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    user_agent: String,
    accept_language: String,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, accept_language: &str) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            user_agent: user_agent.to_string(),
            accept_language: accept_language.to_string(),
        })
    }

    pub fn with_defaults() -> Result<Self, reqwest::Error> {
        Self::new(DEFAULT_USER_AGENT, DEFAULT_ACCEPT_LANGUAGE)
    }
}

/// `Cookie` header value for the cookies that apply to `url`'s host.
fn cookie_header(cookies: &[Cookie], url: &str) -> Option<String> {
    let host = Url::parse(url).ok()?.host_str()?.to_string();
    let pairs: Vec<String> = cookies
        .iter()
        .filter(|c| c.applies_to(&host))
        .map(|c| format!("{}={}", c.name, c.value))
        .collect();
    (!pairs.is_empty()).then(|| pairs.join("; "))
}

/// The browser session's cookies for `url`, so downloads stay logged in.
async fn session_cookie_header(page: &dyn Page, url: &str) -> Option<String> {
    match page.cookies().await {
        Ok(cookies) => cookie_header(&cookies, url),
        Err(err) => {
            debug!(error = %err, "no session cookies for download");
            None
        }
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, page: &dyn Page, url: &str, timeout: Duration) -> Option<Vec<u8>> {
        info!(url, timeout_ms = timeout.as_millis() as u64, "downloading PDF");

        let mut request = self
            .client
            .get(url)
            .timeout(timeout)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, ACCEPT_DOCUMENTS)
            .header(ACCEPT_LANGUAGE, &self.accept_language);
        if let Some(header) = session_cookie_header(page, url).await {
            request = request.header(COOKIE, header);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                error!(url, error = %err, "PDF request failed");
                return None;
            }
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if !status.is_success() {
            error!(url, %status, content_type = %content_type, "PDF download failed");
            match response.text().await {
                Ok(body) => {
                    let excerpt: String = body.chars().take(ERROR_BODY_EXCERPT).collect();
                    debug!(body = %excerpt, "error response body");
                }
                Err(err) => warn!(error = %err, "could not read error response body"),
            }
            return None;
        }
        if !content_type.contains("application/pdf") {
            warn!(url, content_type = %content_type, "response is not declared as PDF, extracting anyway");
        }

        match response.bytes().await {
            Ok(body) if body.is_empty() => {
                warn!(url, "PDF response body is empty");
                None
            }
            Ok(body) => {
                info!(url, bytes = body.len(), "PDF downloaded");
                Some(body.to_vec())
            }
            Err(err) => {
                error!(url, error = %err, "failed to read PDF body");
                None
            }
        }
    }
}

/// Plain text of every page in order. Never fails: errors become markers.
pub fn extract_text(data: &[u8]) -> String {
    if data.is_empty() {
        error!("PDF data is empty");
        return PdfError::Empty.marker();
    }
    let document = match Document::load_mem(data) {
        Ok(document) => document,
        Err(err) => {
            error!(error = %err, "PDF could not be parsed");
            return PdfError::Parse(err.to_string()).marker();
        }
    };

    let pages = document.get_pages();
    info!(bytes = data.len(), pages = pages.len(), "extracting PDF text");

    let mut parts = Vec::with_capacity(pages.len());
    for &number in pages.keys() {
        match document.extract_text(&[number]) {
            Ok(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    parts.push(text.to_string());
                }
            }
            Err(err) => {
                warn!(page = number, error = %err, "PDF page failed");
                parts.push(format!("--- Error processing page {number}: {err} ---"));
            }
        }
    }

    let joined = parts.join(PAGE_SEPARATOR);
    let cleaned = joined
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    info!(chars = cleaned.chars().count(), "PDF text extracted");

    if cleaned.is_empty() {
        NO_TEXT.to_string()
    } else {
        cleaned
    }
}

/// [`extract_text`] on the blocking pool.
pub async fn extract_text_offloaded(data: Vec<u8>) -> String {
    match tokio::task::spawn_blocking(move || extract_text(&data)).await {
        Ok(text) => text,
        Err(err) => {
            error!(error = %err, "PDF extraction worker failed");
            PdfError::Worker(err.to_string()).marker()
        }
    }
}

/// Download then extract. Always yields text or a marker.
pub async fn fetch_and_extract(fetcher: &dyn DocumentFetcher, page: &dyn Page, url: &str) -> String {
    match fetcher.fetch(page, url, download_timeout()).await {
        Some(bytes) => extract_text_offloaded(bytes).await,
        None => {
            error!(url, "PDF download failed");
            PdfError::Download.marker()
        }
    }
}
