use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use lyohub::config::{
    BatchConfig, Config, ConfigLoader, SPL_SET_ID_URL, UrlConfig, Urls, fill_template,
};
use lyohub::error::LyoError;

#[test]
fn defaults_fill_every_field() {
    let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
    assert_eq!(resolved.schema_version, 1);
    assert_eq!(resolved.http_timeout, Duration::from_secs(60));
    assert_eq!(resolved.urls, Urls::default());
    assert_eq!(resolved.batch.approvals, 10_000);
    assert_eq!(resolved.batch.lyophilized_copy, 5_000);
    assert_eq!(resolved.batch.progress_every, 50);
    assert!(resolved.database_path.ends_with("lyohub/lyohub.sqlite3"));
    assert!(resolved.staging_dir.ends_with("lyohub/drugsData"));
}

#[test]
fn overrides_are_applied() {
    let config = Config {
        database_path: Some("/tmp/lyo/db.sqlite3".to_string()),
        http_timeout_secs: Some(5),
        urls: UrlConfig {
            spl_document: Some("http://localhost:8080/spls/{}.xml".to_string()),
            ..UrlConfig::default()
        },
        batch: BatchConfig {
            approvals: Some(100),
            ..BatchConfig::default()
        },
        ..Config::default()
    };

    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.database_path.as_str(), "/tmp/lyo/db.sqlite3");
    assert_eq!(resolved.http_timeout, Duration::from_secs(5));
    assert_eq!(resolved.urls.spl_document, "http://localhost:8080/spls/{}.xml");
    assert_eq!(resolved.urls.spl_set_id, SPL_SET_ID_URL);
    assert_eq!(resolved.batch.approvals, 100);
    assert_eq!(resolved.batch.lyophilized_copy, 5_000);
}

#[test]
fn template_without_placeholder_is_rejected() {
    let config = Config {
        urls: UrlConfig {
            spl_document: Some("http://localhost/spls.xml".to_string()),
            ..UrlConfig::default()
        },
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(LyoError::ConfigParse(_))
    );
}

#[test]
fn zero_batch_is_rejected() {
    let config = Config {
        batch: BatchConfig {
            progress_every: Some(0),
            ..BatchConfig::default()
        },
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(LyoError::ConfigParse(_))
    );
}

#[test]
fn explicit_missing_file_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, LyoError::MissingConfig(_));
}

#[test]
fn reads_json_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("lyohub.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "staging_dir": "/var/tmp/lyohub/drugsData",
            "batch": {"lyophilized_copy": 250}
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.staging_dir.as_str(), "/var/tmp/lyohub/drugsData");
    assert_eq!(resolved.batch.lyophilized_copy, 250);
}

#[test]
fn malformed_json_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("lyohub.json");
    fs::write(&path, "{ not json").unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(LyoError::ConfigParse(_))
    );
}

#[test]
fn set_id_template_takes_three_values() {
    let url = fill_template(SPL_SET_ID_URL, &["BLA761001", "2", "1000"]);
    assert_eq!(
        url,
        "https://dailymed.nlm.nih.gov/dailymed/services/v2/spls.json?application_number=BLA761001&page=2&pagesize=1000"
    );
}
