mod common;

use assert_matches::assert_matches;

use lyohub::dailymed::{PageMetadata, SetIdEntry, SetIdPage};
use lyohub::domain::{ApplicationNumber, DrugRecord, Lyophilized, SetId};
use lyohub::error::LyoError;
use lyohub::labels::{LabelResolver, ResolveScope, copy_lyophilized, resolve_into_store};
use lyohub::store::{Collection, Filter, Query, Store};

use common::{MockDailyMed, first_page_url, mock_urls, page};

const KIT_SETID: &str = "7f2c5b1e-0d3a-4c55-9a61-1b7e2c3d4f50";
const WATER_SETID: &str = "0c1d2e3f-1111-4222-8333-444455556666";

fn number(value: &str) -> ApplicationNumber {
    value.parse().unwrap()
}

#[test]
fn follows_next_page_until_null_marker() {
    let urls = mock_urls();
    let client = MockDailyMed::default()
        .with_page(
            first_page_url("BLA761001"),
            page(
                &[(KIT_SETID, "EXAMPLIMAB (examplimab) injection, powder, LYOPHILIZED, for solution")],
                Some("mock://url2"),
            ),
        )
        .with_page(
            "mock://url2",
            page(&[(WATER_SETID, "STERILE WATER injection")], Some("null")),
        );
    let resolver = LabelResolver::new(&client, &urls);

    let resolution = resolver.resolve(&number("BLA761001")).unwrap();

    assert_eq!(client.total_calls(), 2);
    assert_eq!(resolution.lyophilized, Lyophilized::Lyophilized);
    assert_eq!(resolution.labels.len(), 2);
    let kit = &resolution.labels[&KIT_SETID.parse::<SetId>().unwrap()];
    assert_eq!(
        kit.title,
        "examplimab (examplimab) injection, powder, lyophilized, for solution"
    );
    assert_eq!(
        kit.web_url,
        format!("https://dailymed.nlm.nih.gov/dailymed/drugInfo.cfm?setid={KIT_SETID}")
    );
}

#[test]
fn no_labels_means_unknown() {
    let urls = mock_urls();
    let client = MockDailyMed::default().with_page(first_page_url("NDA000002"), page(&[], None));
    let resolver = LabelResolver::new(&client, &urls);

    let resolution = resolver.resolve(&number("NDA000002")).unwrap();
    assert_eq!(resolution.lyophilized, Lyophilized::Unknown);
    assert!(resolution.labels.is_empty());
}

#[test]
fn incomplete_entries_are_skipped() {
    let urls = mock_urls();
    let client = MockDailyMed::default().with_page(
        first_page_url("NDA000003"),
        SetIdPage {
            data: vec![
                SetIdEntry {
                    setid: Some(WATER_SETID.to_string()),
                    title: None,
                },
                SetIdEntry {
                    setid: None,
                    title: Some("orphan title".to_string()),
                },
                SetIdEntry {
                    setid: Some(KIT_SETID.to_string()),
                    title: Some("Examplimab tablet".to_string()),
                },
            ],
            metadata: PageMetadata {
                next_page_url: Some("null".to_string()),
            },
        },
    );
    let resolver = LabelResolver::new(&client, &urls);

    let resolution = resolver.resolve(&number("NDA000003")).unwrap();
    assert_eq!(resolution.labels.len(), 1);
    assert_eq!(resolution.lyophilized, Lyophilized::NotLyophilized);
}

#[test]
fn client_errors_propagate_from_resolve() {
    let urls = mock_urls();
    let client = MockDailyMed::default();
    let resolver = LabelResolver::new(&client, &urls);

    let err = resolver.resolve(&number("NDA404404")).unwrap_err();
    assert_matches!(err, LyoError::HttpStatus { status: 404, .. });
}

fn seed(store: &Store, records: &[DrugRecord]) {
    store.upsert_many(Collection::Ingredients, records).unwrap();
}

#[test]
fn stage_resolves_missing_and_skips_failures() {
    let store = Store::open_in_memory().unwrap();
    seed(
        &store,
        &[
            DrugRecord::keyed(number("BLA761001")),
            DrugRecord::keyed(number("NDA000404")),
        ],
    );

    let urls = mock_urls();
    let client = MockDailyMed::default().with_page(
        first_page_url("BLA761001"),
        page(&[(KIT_SETID, "Examplimab kit, LYOPHILIZED powder")], Some("null")),
    );
    let resolver = LabelResolver::new(&client, &urls);

    let summary = resolve_into_store(&store, &resolver, ResolveScope::Missing, 50).unwrap();
    assert_eq!(summary.considered, 2);
    assert_eq!(summary.resolved, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.lyophilized, 1);

    let stored: DrugRecord = store
        .get_as(Collection::Ingredients, "BLA761001")
        .unwrap()
        .unwrap();
    assert_eq!(stored.lyophilized, Some(Lyophilized::Lyophilized));
    assert_eq!(stored.set_ids.unwrap().len(), 1);

    let failed: DrugRecord = store
        .get_as(Collection::Ingredients, "NDA000404")
        .unwrap()
        .unwrap();
    assert!(failed.set_ids.is_none());

    // A second pass only looks at drugs that still lack labels.
    let calls_before = client.total_calls();
    let rerun = resolve_into_store(&store, &resolver, ResolveScope::Missing, 50).unwrap();
    assert_eq!(rerun.considered, 1);
    assert_eq!(client.total_calls(), calls_before + 1);
}

#[test]
fn rerun_never_demotes_a_lyophilized_drug() {
    let store = Store::open_in_memory().unwrap();
    seed(
        &store,
        &[DrugRecord {
            lyophilized: Some(Lyophilized::Lyophilized),
            ..DrugRecord::keyed(number("BLA761001"))
        }],
    );

    let urls = mock_urls();
    let client = MockDailyMed::default().with_page(
        first_page_url("BLA761001"),
        page(&[(WATER_SETID, "sterile water injection")], None),
    );
    let resolver = LabelResolver::new(&client, &urls);

    let summary = resolve_into_store(&store, &resolver, ResolveScope::All, 50).unwrap();
    assert_eq!(summary.lyophilized, 1);

    let stored: DrugRecord = store
        .get_as(Collection::Ingredients, "BLA761001")
        .unwrap()
        .unwrap();
    assert_eq!(stored.lyophilized, Some(Lyophilized::Lyophilized));
}

#[test]
fn unknown_is_stored_as_na() {
    let store = Store::open_in_memory().unwrap();
    seed(&store, &[DrugRecord::keyed(number("NDA000002"))]);

    let urls = mock_urls();
    let client = MockDailyMed::default().with_page(first_page_url("NDA000002"), page(&[], None));
    let resolver = LabelResolver::new(&client, &urls);
    resolve_into_store(&store, &resolver, ResolveScope::Missing, 50).unwrap();

    let raw = store
        .get(Collection::Ingredients, "NDA000002")
        .unwrap()
        .unwrap();
    assert_eq!(raw["lyophilized"], serde_json::json!("N/A"));
    assert_eq!(raw["set_ids"], serde_json::json!({}));
}

#[test]
fn copies_only_lyophilized_records() {
    let store = Store::open_in_memory().unwrap();
    seed(
        &store,
        &[
            DrugRecord {
                company: Some("acme".to_string()),
                lyophilized: Some(Lyophilized::Lyophilized),
                ..DrugRecord::keyed(number("BLA761001"))
            },
            DrugRecord {
                lyophilized: Some(Lyophilized::NotLyophilized),
                ..DrugRecord::keyed(number("NDA000001"))
            },
            DrugRecord {
                lyophilized: Some(Lyophilized::Unknown),
                ..DrugRecord::keyed(number("NDA000002"))
            },
        ],
    );

    let summary = copy_lyophilized(&store, 1).unwrap();
    assert_eq!(summary.copied, 1);
    assert_eq!(summary.written.inserted, 1);

    assert_eq!(store.count(Collection::Lyophilized, Query::all()).unwrap(), 1);
    let copied: DrugRecord = store
        .get_as(Collection::Lyophilized, "BLA761001")
        .unwrap()
        .unwrap();
    assert_eq!(copied.company.as_deref(), Some("acme"));
    assert_eq!(
        store
            .count(
                Collection::Lyophilized,
                Query::all().filter(Filter::eq("lyophilized", true))
            )
            .unwrap(),
        1
    );
}

#[test]
fn copy_flushes_in_batches_past_the_first_page() {
    let store = Store::open_in_memory().unwrap();
    let records: Vec<DrugRecord> = (0..1_203)
        .map(|n| DrugRecord {
            lyophilized: Some(if n % 3 == 0 {
                Lyophilized::NotLyophilized
            } else {
                Lyophilized::Lyophilized
            }),
            ..DrugRecord::keyed(number(&format!("NDA{n:06}")))
        })
        .collect();
    seed(&store, &records);

    let summary = copy_lyophilized(&store, 500).unwrap();
    assert_eq!(summary.copied, 802);
    assert_eq!(summary.written.inserted, 802);
    assert_eq!(store.count(Collection::Lyophilized, Query::all()).unwrap(), 802);
    assert!(store.get(Collection::Lyophilized, "NDA001202").unwrap().is_some());
    assert!(store.get(Collection::Lyophilized, "NDA001200").unwrap().is_none());
}

#[test]
fn resolves_every_drug_of_a_large_collection() {
    let store = Store::open_in_memory().unwrap();
    let numbers: Vec<String> = (0..620).map(|n| format!("NDA{n:06}")).collect();
    let records: Vec<DrugRecord> = numbers
        .iter()
        .map(|value| DrugRecord::keyed(number(value)))
        .collect();
    seed(&store, &records);

    let urls = mock_urls();
    let client = numbers.iter().fold(MockDailyMed::default(), |client, value| {
        client.with_page(
            first_page_url(value),
            page(&[(WATER_SETID, "sterile water injection")], Some("null")),
        )
    });
    let resolver = LabelResolver::new(&client, &urls);

    let summary = resolve_into_store(&store, &resolver, ResolveScope::Missing, 100).unwrap();
    assert_eq!(summary.considered, 620);
    assert_eq!(summary.resolved, 620);
    assert_eq!(summary.not_lyophilized, 620);
    assert_eq!(client.total_calls(), 620);
    assert_eq!(
        store
            .count(
                Collection::Ingredients,
                Query::all().filter(Filter::Missing("set_ids".to_string()))
            )
            .unwrap(),
        0
    );
}
