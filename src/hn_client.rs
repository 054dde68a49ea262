use reqwest::blocking::Client;
use std::time::Duration;
use thiserror::Error;

use crate::models::{HackerNewsItem, ItemId, StoryList};

pub const DEFAULT_API_BASE: &str = "https://hacker-news.firebaseio.com/v0/";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

const PERMALINK_URL: &str = "https://news.ycombinator.com/item?id=";
const PROFILE_URL: &str = "https://news.ycombinator.com/user?id=";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    /// A story list answered `null`. Treating that as an empty list would make every new
    /// story look like it just disappeared.
    #[error("{url} answered null instead of a list")]
    NullList { url: String },
}

/// Where the engine gets its data from.
///
/// `fetch_item` returning `Ok(None)` means upstream answered `null`: the id was advertised
/// but never published. That is not an error and must not be confused with `Err`.
pub trait ItemSource {
    fn fetch_item(&self, id: ItemId) -> Result<Option<HackerNewsItem>, FetchError>;
    fn fetch_list(&self, list: StoryList) -> Result<Vec<ItemId>, FetchError>;
}

pub struct HackerNewsClient {
    client: Client,
    api_base: String,
}

impl HackerNewsClient {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_options(DEFAULT_API_BASE, DEFAULT_TIMEOUT)
    }

    pub fn with_options(api_base: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("hn_watch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut api_base = api_base.to_string();
        if !api_base.ends_with('/') {
            api_base.push('/');
        }

        Ok(Self { client, api_base })
    }

    fn item_url(&self, id: ItemId) -> String {
        format!("{}item/{}.json", self.api_base, id)
    }

    fn list_url(&self, list: StoryList) -> String {
        format!("{}{}", self.api_base, list.endpoint())
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let body = self.get_body(url)?;
        decode(url, &body)
    }

    fn get_body(&self, url: &str) -> Result<String, FetchError> {
        tracing::debug!("requesting url: {}", url);
        let response = self.client.get(url).send().map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;
        Ok(body)
    }
}

fn decode<T: serde::de::DeserializeOwned>(url: &str, body: &str) -> Result<T, FetchError> {
    serde_json::from_str(body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

fn decode_list(url: &str, body: &str) -> Result<Vec<ItemId>, FetchError> {
    let ids: Option<Vec<ItemId>> = decode(url, body)?;
    ids.ok_or_else(|| FetchError::NullList {
        url: url.to_string(),
    })
}

impl ItemSource for HackerNewsClient {
    fn fetch_item(&self, id: ItemId) -> Result<Option<HackerNewsItem>, FetchError> {
        // The API answers `null` for ids it never published.
        self.get_json(&self.item_url(id))
    }

    fn fetch_list(&self, list: StoryList) -> Result<Vec<ItemId>, FetchError> {
        let url = self.list_url(list);
        let body = self.get_body(&url)?;
        decode_list(&url, &body)
    }
}

/// Unescape HTML entities and turn `<p>` into paragraph breaks.
///
/// Not a sanitizer: other markup passes through and callers still escape for display.
pub fn clean_text(text: &str) -> String {
    html_escape::decode_html_entities(text).replace("<p>", "\n\n")
}

pub fn permalink(id: ItemId) -> String {
    format!("{PERMALINK_URL}{id}")
}

pub fn profile_url(user: &str) -> String {
    format!("{PROFILE_URL}{user}")
}
