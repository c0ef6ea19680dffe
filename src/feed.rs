use std::fs::{self, File};
use std::io::{self, BufReader};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::LyoError;
use crate::http::RequestClient;

pub const ARCHIVE_FILE: &str = "tempDrugsData.zip";
pub const PAYLOAD_FILE: &str = "fdaDrugsData.json";

/// Top level of the openFDA `drugsfda` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApprovalFeed {
    #[serde(default)]
    pub results: Vec<RawApproval>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawApproval {
    #[serde(default)]
    pub application_number: Option<String>,
    #[serde(default)]
    pub sponsor_name: Option<String>,
    #[serde(default)]
    pub products: Vec<RawProduct>,
    #[serde(default)]
    pub submissions: Vec<RawSubmission>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawProduct {
    #[serde(default)]
    pub brand_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSubmission {
    #[serde(default)]
    pub submission_status_date: Option<String>,
}

pub trait ApprovalFeedClient {
    /// Fetches the archive at `url` into `destination`.
    fn download(&self, url: &str, destination: &Utf8Path) -> Result<(), LyoError>;
}

#[derive(Clone)]
pub struct ApprovalFeedHttpClient {
    http: RequestClient,
}

impl ApprovalFeedHttpClient {
    pub fn new(http: RequestClient) -> Self {
        Self { http }
    }
}

impl ApprovalFeedClient for ApprovalFeedHttpClient {
    fn download(&self, url: &str, destination: &Utf8Path) -> Result<(), LyoError> {
        let response = self.http.get(url)?;
        fs::write(destination, &response.body)
            .map_err(|err| LyoError::Filesystem(format!("write {destination}: {err}")))?;
        debug!(%url, bytes = response.body.len(), "approval archive downloaded");
        Ok(())
    }
}

impl<T: ApprovalFeedClient + ?Sized> ApprovalFeedClient for &T {
    fn download(&self, url: &str, destination: &Utf8Path) -> Result<(), LyoError> {
        (**self).download(url, destination)
    }
}

/// Stages the bulk approval feed under one directory.
pub struct FeedLoader<'a, C: ApprovalFeedClient> {
    client: C,
    url: &'a str,
    staging_dir: &'a Utf8Path,
}

impl<'a, C: ApprovalFeedClient> FeedLoader<'a, C> {
    pub fn new(client: C, url: &'a str, staging_dir: &'a Utf8Path) -> Self {
        Self {
            client,
            url,
            staging_dir,
        }
    }

    pub fn archive_path(&self) -> Utf8PathBuf {
        self.staging_dir.join(ARCHIVE_FILE)
    }

    pub fn payload_path(&self) -> Utf8PathBuf {
        self.staging_dir.join(PAYLOAD_FILE)
    }

    /// Downloads and unpacks the archive, leaving only the canonical
    /// payload behind. With `skip_download` an already staged payload is
    /// reused as is.
    pub fn prepare(&self, skip_download: bool) -> Result<Utf8PathBuf, LyoError> {
        let payload = self.payload_path();
        if skip_download {
            if !payload.exists() {
                return Err(LyoError::Filesystem(format!(
                    "no staged approval payload at {payload}"
                )));
            }
            info!(path = %payload, "reusing staged approval payload");
            return Ok(payload);
        }

        fs::create_dir_all(self.staging_dir)
            .map_err(|err| LyoError::Filesystem(format!("create {}: {err}", self.staging_dir)))?;
        let archive = self.archive_path();
        info!(url = %self.url, "downloading approval archive");
        self.client.download(self.url, &archive)?;

        extract_single_payload(&archive, self.staging_dir, PAYLOAD_FILE)?;
        fs::remove_file(&archive)
            .map_err(|err| LyoError::Filesystem(format!("remove {archive}: {err}")))?;
        info!(path = %payload, "approval payload staged");
        Ok(payload)
    }
}

/// Extracts the only file in `archive` to `target_dir/canonical_name`.
pub fn extract_single_payload(
    archive: &Utf8Path,
    target_dir: &Utf8Path,
    canonical_name: &str,
) -> Result<Utf8PathBuf, LyoError> {
    let file = File::open(archive)
        .map_err(|err| LyoError::Filesystem(format!("open zip {archive}: {err}")))?;
    let mut zip = ZipArchive::new(file)
        .map_err(|err| LyoError::ArchiveLayout(format!("{archive}: {err}")))?;

    let mut payloads = Vec::new();
    for i in 0..zip.len() {
        let entry = zip
            .by_index(i)
            .map_err(|err| LyoError::ArchiveLayout(err.to_string()))?;
        if entry.enclosed_name().is_none() {
            return Err(LyoError::ArchiveLayout(format!(
                "zip entry {} escapes the staging directory",
                entry.name()
            )));
        }
        if !entry.is_dir() {
            payloads.push(i);
        }
    }

    let index = match payloads.as_slice() {
        [index] => *index,
        [] => return Err(LyoError::ArchiveLayout(format!("{archive} holds no payload file"))),
        many => {
            return Err(LyoError::ArchiveLayout(format!(
                "{archive} holds {} payload files, expected one",
                many.len()
            )));
        }
    };

    let mut entry = zip
        .by_index(index)
        .map_err(|err| LyoError::ArchiveLayout(err.to_string()))?;
    let target = target_dir.join(canonical_name);
    let mut temp = tempfile::Builder::new()
        .prefix("lyohub-payload")
        .tempfile_in(target_dir.as_std_path())
        .map_err(|err| LyoError::Filesystem(format!("create temp file in {target_dir}: {err}")))?;
    io::copy(&mut entry, temp.as_file_mut())
        .map_err(|err| LyoError::Filesystem(format!("extract {}: {err}", entry.name())))?;
    // A half-written payload never replaces the previous one.
    temp.persist(target.as_std_path())
        .map_err(|err| LyoError::Filesystem(format!("persist {target}: {err}")))?;
    debug!(entry = entry.name(), path = %target, "payload extracted");
    Ok(target)
}

/// Reads the `results` array of a staged payload.
pub fn load_results(payload: &Utf8Path) -> Result<Vec<RawApproval>, LyoError> {
    let file = File::open(payload)
        .map_err(|err| LyoError::Filesystem(format!("open {payload}: {err}")))?;
    let feed: ApprovalFeed = serde_json::from_reader(BufReader::new(file))
        .map_err(|err| LyoError::parse(format!("approval payload {payload}"), err))?;
    info!(records = feed.results.len(), "approval payload loaded");
    Ok(feed.results)
}
