mod common;

use chrono::NaiveDate;

use lyohub::domain::{DrugRecord, Lyophilized};
use lyohub::feed::{ApprovalFeed, RawApproval, RawProduct, RawSubmission};
use lyohub::normalize::{DrugMeta, normalize, store_approvals};
use lyohub::store::{Collection, Query, Store};

use common::fixture;

fn acme() -> RawApproval {
    RawApproval {
        application_number: Some("NDA123456".to_string()),
        sponsor_name: Some("ACME Labs".to_string()),
        products: vec![RawProduct {
            brand_name: Some("Acme".to_string()),
        }],
        submissions: vec![RawSubmission {
            submission_status_date: Some("20200115".to_string()),
        }],
    }
}

#[test]
fn single_approval_normalizes() {
    let meta = normalize(&acme()).unwrap();
    assert_eq!(meta.application_number.as_str(), "NDA123456");
    assert_eq!(meta.company, "acme labs");
    assert_eq!(meta.products, vec!["acme"]);
    assert_eq!(meta.date, vec![NaiveDate::from_ymd_opt(2020, 1, 15).unwrap()]);
}

#[test]
fn feed_fixture_is_stored_in_both_collections() {
    let feed: ApprovalFeed = serde_json::from_str(&fixture("drugsfda_sample.json")).unwrap();
    let store = Store::open_in_memory().unwrap();

    let summary = store_approvals(&store, &feed.results, 2).unwrap();

    assert_eq!(summary.received, 3);
    assert_eq!(summary.normalized, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.drugs_meta.inserted, 2);
    assert_eq!(summary.ingredients.inserted, 2);

    let meta: DrugMeta = store
        .get_as(Collection::DrugsMeta, "BLA761001")
        .unwrap()
        .unwrap();
    assert_eq!(meta.company, "acme biologics");
    assert_eq!(meta.products, vec!["examplimab"]);
    assert_eq!(
        meta.date,
        vec![
            NaiveDate::from_ymd_opt(2020, 1, 15).unwrap(),
            NaiveDate::from_ymd_opt(2022, 3, 10).unwrap(),
        ]
    );

    let record: DrugRecord = store
        .get_as(Collection::Ingredients, "BLA761001")
        .unwrap()
        .unwrap();
    assert_eq!(record.first_date(), NaiveDate::from_ymd_opt(2020, 1, 15));
    assert!(record.lyophilized.is_none());
    assert!(record.lut.is_some());

    assert!(
        store
            .get(Collection::Ingredients, "ANDA099999")
            .unwrap()
            .is_none()
    );
}

#[test]
fn reloading_keeps_resolver_fields() {
    let store = Store::open_in_memory().unwrap();
    store_approvals(&store, &[acme()], 10_000).unwrap();
    store
        .upsert_many(
            Collection::Ingredients,
            &[DrugRecord {
                lyophilized: Some(Lyophilized::Lyophilized),
                ..DrugRecord::keyed("NDA123456".parse().unwrap())
            }],
        )
        .unwrap();

    let summary = store_approvals(&store, &[acme()], 10_000).unwrap();
    assert_eq!(summary.ingredients.matched, 1);
    assert_eq!(summary.ingredients.modified, 0);

    let record: DrugRecord = store
        .get_as(Collection::Ingredients, "NDA123456")
        .unwrap()
        .unwrap();
    assert_eq!(record.lyophilized, Some(Lyophilized::Lyophilized));
    assert_eq!(
        store.count(Collection::DrugsMeta, Query::all()).unwrap(),
        1
    );
}
