use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};

use crate::error::LyoError;
use crate::http::{RequestClient, RequestSpec};

/// One page of the `spls.json` set-id search.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SetIdPage {
    #[serde(default)]
    pub data: Vec<SetIdEntry>,
    #[serde(default)]
    pub metadata: PageMetadata,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SetIdEntry {
    #[serde(default)]
    pub setid: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PageMetadata {
    #[serde(default)]
    pub next_page_url: Option<String>,
}

pub trait DailyMedClient {
    fn fetch_set_id_page(&self, url: &str) -> Result<SetIdPage, LyoError>;
    fn fetch_spl_document(&self, url: &str) -> Result<String, LyoError>;
    fn fetch_search_page(&self, url: &str) -> Result<String, LyoError>;
}

#[derive(Clone)]
pub struct DailyMedHttpClient {
    http: RequestClient,
}

impl DailyMedHttpClient {
    pub fn new(http: RequestClient) -> Self {
        Self { http }
    }
}

impl DailyMedClient for DailyMedHttpClient {
    fn fetch_set_id_page(&self, url: &str) -> Result<SetIdPage, LyoError> {
        self.http.request(&accepting(url, "application/json"))?.json()
    }

    fn fetch_spl_document(&self, url: &str) -> Result<String, LyoError> {
        Ok(self.http.request(&accepting(url, "application/xml"))?.text())
    }

    fn fetch_search_page(&self, url: &str) -> Result<String, LyoError> {
        Ok(self.http.request(&accepting(url, "text/html"))?.text())
    }
}

fn accepting(url: &str, media_type: &'static str) -> RequestSpec {
    RequestSpec::get(url).header("accept", HeaderValue::from_static(media_type))
}

impl<T: DailyMedClient + ?Sized> DailyMedClient for &T {
    fn fetch_set_id_page(&self, url: &str) -> Result<SetIdPage, LyoError> {
        (**self).fetch_set_id_page(url)
    }

    fn fetch_spl_document(&self, url: &str) -> Result<String, LyoError> {
        (**self).fetch_spl_document(url)
    }

    fn fetch_search_page(&self, url: &str) -> Result<String, LyoError> {
        (**self).fetch_search_page(url)
    }
}
