#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Mutex;

use camino::Utf8Path;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use lyohub::config::Urls;
use lyohub::dailymed::{DailyMedClient, PageMetadata, SetIdEntry, SetIdPage};
use lyohub::error::LyoError;
use lyohub::feed::ApprovalFeedClient;

pub const SPL_SET_ID_TEMPLATE: &str = "mock://spls?application_number={}&page={}&pagesize={}";

pub fn mock_urls() -> Urls {
    Urls {
        fda_drugs_data: "mock://feed/drugsfda.json.zip".to_string(),
        spl_set_id: SPL_SET_ID_TEMPLATE.to_string(),
        spl_document: "mock://spls/{}.xml".to_string(),
        dailymed_webpage: "https://dailymed.nlm.nih.gov/dailymed/drugInfo.cfm?setid={}".to_string(),
        lyophilized_from_dosage: "mock://search/dosage?page={}".to_string(),
        lyophilized_from_description: "mock://search/description?page={}".to_string(),
    }
}

pub fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name);
    fs::read_to_string(path).unwrap()
}

pub fn first_page_url(application_number: &str) -> String {
    format!("mock://spls?application_number={application_number}&page=1&pagesize=1000")
}

pub fn page(entries: &[(&str, &str)], next: Option<&str>) -> SetIdPage {
    SetIdPage {
        data: entries
            .iter()
            .map(|(setid, title)| SetIdEntry {
                setid: Some(setid.to_string()),
                title: Some(title.to_string()),
            })
            .collect(),
        metadata: PageMetadata {
            next_page_url: next.map(str::to_string),
        },
    }
}

/// Serves canned responses keyed by URL and records every request.
#[derive(Default)]
pub struct MockDailyMed {
    pub set_id_pages: HashMap<String, SetIdPage>,
    pub documents: HashMap<String, String>,
    pub search_pages: HashMap<String, String>,
    pub failing: Vec<String>,
    pub unreachable: Vec<String>,
    pub missing: Vec<String>,
    pub calls: Mutex<Vec<String>>,
}

impl MockDailyMed {
    pub fn with_page(mut self, url: impl Into<String>, page: SetIdPage) -> Self {
        self.set_id_pages.insert(url.into(), page);
        self
    }

    pub fn with_document(mut self, setid: &str, xml: impl Into<String>) -> Self {
        self.documents.insert(format!("mock://spls/{setid}.xml"), xml.into());
        self
    }

    pub fn with_search_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.search_pages.insert(url.into(), html.into());
        self
    }

    pub fn failing_on(mut self, url: impl Into<String>) -> Self {
        self.failing.push(url.into());
        self
    }

    /// Every request to `url` fails at the network level.
    pub fn unreachable_on(mut self, url: impl Into<String>) -> Self {
        self.unreachable.push(url.into());
        self
    }

    /// Every request to `url` answers 404.
    pub fn not_found_on(mut self, url: impl Into<String>) -> Self {
        self.missing.push(url.into());
        self
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.as_str() == url)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, url: &str) -> Result<(), LyoError> {
        self.calls.lock().unwrap().push(url.to_string());
        if self.failing.iter().any(|failing| failing == url) {
            return Err(LyoError::HttpStatus {
                url: url.to_string(),
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        if self.unreachable.iter().any(|unreachable| unreachable == url) {
            return Err(LyoError::TransientNetwork {
                url: url.to_string(),
                message: "connection: connection refused".to_string(),
            });
        }
        if self.missing.iter().any(|missing| missing == url) {
            return Err(Self::not_found(url));
        }
        Ok(())
    }

    fn not_found(url: &str) -> LyoError {
        LyoError::HttpStatus {
            url: url.to_string(),
            status: 404,
            body: "not found".to_string(),
        }
    }
}

impl DailyMedClient for MockDailyMed {
    fn fetch_set_id_page(&self, url: &str) -> Result<SetIdPage, LyoError> {
        self.record(url)?;
        self.set_id_pages
            .get(url)
            .cloned()
            .ok_or_else(|| Self::not_found(url))
    }

    fn fetch_spl_document(&self, url: &str) -> Result<String, LyoError> {
        self.record(url)?;
        self.documents
            .get(url)
            .cloned()
            .ok_or_else(|| Self::not_found(url))
    }

    fn fetch_search_page(&self, url: &str) -> Result<String, LyoError> {
        self.record(url)?;
        // Past the last page the real search repeats an empty listing.
        Ok(self
            .search_pages
            .get(url)
            .cloned()
            .unwrap_or_else(|| "<html><body></body></html>".to_string()))
    }
}

pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Writes a fixed archive wherever the loader asks for it.
pub struct MockFeed {
    pub archive: Vec<u8>,
    pub downloads: Mutex<usize>,
}

impl MockFeed {
    pub fn new(archive: Vec<u8>) -> Self {
        Self {
            archive,
            downloads: Mutex::new(0),
        }
    }

    pub fn download_count(&self) -> usize {
        *self.downloads.lock().unwrap()
    }
}

impl ApprovalFeedClient for MockFeed {
    fn download(&self, _url: &str, destination: &Utf8Path) -> Result<(), LyoError> {
        *self.downloads.lock().unwrap() += 1;
        fs::write(destination, &self.archive).map_err(|err| LyoError::Filesystem(err.to_string()))
    }
}
