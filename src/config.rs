use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::LyoError;

pub const DEFAULT_CONFIG_FILE: &str = "lyohub.json";

pub const FDA_DRUGS_DATA_URL: &str =
    "https://download.open.fda.gov/drug/drugsfda/drug-drugsfda-0001-of-0001.json.zip";
pub const SPL_SET_ID_URL: &str = "https://dailymed.nlm.nih.gov/dailymed/services/v2/spls.json?application_number={}&page={}&pagesize={}";
pub const SPL_DOCUMENT_URL: &str = "https://dailymed.nlm.nih.gov/dailymed/services/v2/spls/{}.xml";
pub const DAILYMED_WEBPAGE_URL: &str = "https://dailymed.nlm.nih.gov/dailymed/drugInfo.cfm?setid={}";
pub const LYOPHILIZED_FROM_DOSAGE_URL: &str = "https://dailymed.nlm.nih.gov/dailymed/search.cfm?adv=1&labeltype=all&query=43678-2%3A%28lyophilized%29+&page={}&pagesize=200";
pub const LYOPHILIZED_FROM_DESCRIPTION_URL: &str = "https://dailymed.nlm.nih.gov/dailymed/search.cfm?adv=1&labeltype=all&pagesize=200&page={}&query=34089-3%3A%28lyophilized%29+";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub staging_dir: Option<String>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub urls: UrlConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct UrlConfig {
    #[serde(default)]
    pub fda_drugs_data: Option<String>,
    #[serde(default)]
    pub spl_set_id: Option<String>,
    #[serde(default)]
    pub spl_document: Option<String>,
    #[serde(default)]
    pub dailymed_webpage: Option<String>,
    #[serde(default)]
    pub lyophilized_from_dosage: Option<String>,
    #[serde(default)]
    pub lyophilized_from_description: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub approvals: Option<usize>,
    #[serde(default)]
    pub lyophilized_copy: Option<usize>,
    #[serde(default)]
    pub progress_every: Option<usize>,
}

/// URL templates. `{}` placeholders are filled positionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Urls {
    pub fda_drugs_data: String,
    pub spl_set_id: String,
    pub spl_document: String,
    pub dailymed_webpage: String,
    pub lyophilized_from_dosage: String,
    pub lyophilized_from_description: String,
}

impl Default for Urls {
    fn default() -> Self {
        Self {
            fda_drugs_data: FDA_DRUGS_DATA_URL.to_string(),
            spl_set_id: SPL_SET_ID_URL.to_string(),
            spl_document: SPL_DOCUMENT_URL.to_string(),
            dailymed_webpage: DAILYMED_WEBPAGE_URL.to_string(),
            lyophilized_from_dosage: LYOPHILIZED_FROM_DOSAGE_URL.to_string(),
            lyophilized_from_description: LYOPHILIZED_FROM_DESCRIPTION_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSizes {
    pub approvals: usize,
    pub lyophilized_copy: usize,
    pub progress_every: usize,
}

impl Default for BatchSizes {
    fn default() -> Self {
        Self {
            approvals: 10_000,
            lyophilized_copy: 5_000,
            progress_every: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub database_path: Utf8PathBuf,
    pub staging_dir: Utf8PathBuf,
    pub http_timeout: Duration,
    pub urls: Urls,
    pub batch: BatchSizes,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `lyohub.json` in the working directory. Only an
    /// explicitly named file is required to exist.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, LyoError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if !config_path.exists() {
            if path.is_some() {
                return Err(LyoError::MissingConfig(config_path));
            }
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| LyoError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| LyoError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, LyoError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let data_root = default_data_root()?;

        let database_path = config
            .database_path
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| data_root.join("lyohub.sqlite3"));
        let staging_dir = config
            .staging_dir
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| data_root.join("drugsData"));

        let http_timeout = Duration::from_secs(config.http_timeout_secs.unwrap_or(60));
        if http_timeout.is_zero() {
            return Err(LyoError::ConfigParse(
                "http_timeout_secs must be positive".to_string(),
            ));
        }

        let defaults = Urls::default();
        let urls = Urls {
            fda_drugs_data: config.urls.fda_drugs_data.unwrap_or(defaults.fda_drugs_data),
            spl_set_id: config.urls.spl_set_id.unwrap_or(defaults.spl_set_id),
            spl_document: config.urls.spl_document.unwrap_or(defaults.spl_document),
            dailymed_webpage: config
                .urls
                .dailymed_webpage
                .unwrap_or(defaults.dailymed_webpage),
            lyophilized_from_dosage: config
                .urls
                .lyophilized_from_dosage
                .unwrap_or(defaults.lyophilized_from_dosage),
            lyophilized_from_description: config
                .urls
                .lyophilized_from_description
                .unwrap_or(defaults.lyophilized_from_description),
        };
        check_placeholders("spl_set_id", &urls.spl_set_id, 3)?;
        check_placeholders("spl_document", &urls.spl_document, 1)?;
        check_placeholders("dailymed_webpage", &urls.dailymed_webpage, 1)?;
        check_placeholders("lyophilized_from_dosage", &urls.lyophilized_from_dosage, 1)?;
        check_placeholders(
            "lyophilized_from_description",
            &urls.lyophilized_from_description,
            1,
        )?;

        let defaults = BatchSizes::default();
        let batch = BatchSizes {
            approvals: config.batch.approvals.unwrap_or(defaults.approvals),
            lyophilized_copy: config
                .batch
                .lyophilized_copy
                .unwrap_or(defaults.lyophilized_copy),
            progress_every: config
                .batch
                .progress_every
                .unwrap_or(defaults.progress_every),
        };
        if batch.approvals == 0 || batch.lyophilized_copy == 0 || batch.progress_every == 0 {
            return Err(LyoError::ConfigParse(
                "batch sizes must be positive".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            schema_version,
            database_path,
            staging_dir,
            http_timeout,
            urls,
            batch,
        })
    }
}

/// Fills `{}` placeholders left to right.
pub fn fill_template(template: &str, values: &[&str]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut values = values.iter();
    let mut rest = template;
    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        out.push_str(values.next().copied().unwrap_or_default());
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    out
}

fn check_placeholders(name: &str, template: &str, expected: usize) -> Result<(), LyoError> {
    let found = template.matches("{}").count();
    if found != expected {
        return Err(LyoError::ConfigParse(format!(
            "url template {name} needs {expected} placeholder(s), found {found}"
        )));
    }
    Ok(())
}

fn default_data_root() -> Result<Utf8PathBuf, LyoError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("lyohub")).ok()
        })
        .ok_or_else(|| LyoError::Filesystem("unable to resolve data directory".to_string()))
}
