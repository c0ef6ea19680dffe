use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{ApplicationNumber, DrugRecord, parse_submission_date};
use crate::error::LyoError;
use crate::feed::RawApproval;
use crate::store::{Collection, Store, WriteSummary};

/// Canonical approval metadata, one document per application number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrugMeta {
    pub application_number: ApplicationNumber,
    pub company: String,
    pub products: Vec<String>,
    pub date: Vec<NaiveDate>,
}

impl DrugMeta {
    /// The seed document for the all-drugs collection.
    pub fn to_drug_record(&self) -> DrugRecord {
        DrugRecord {
            application_number: Some(self.application_number.clone()),
            company: Some(self.company.clone()),
            products: Some(self.products.clone()),
            date: Some(self.date.clone()),
            ..DrugRecord::keyed(self.application_number.clone())
        }
    }
}

/// Returns `None` (with a warning) for records that cannot be keyed or
/// dated.
pub fn normalize(raw: &RawApproval) -> Option<DrugMeta> {
    let Some(number) = raw.application_number.as_deref() else {
        warn!("approval record without application number skipped");
        return None;
    };
    let application_number = match number.parse::<ApplicationNumber>() {
        Ok(number) => number,
        Err(err) => {
            warn!(error = %err, "approval record skipped");
            return None;
        }
    };

    let products: BTreeSet<String> = raw
        .products
        .iter()
        .filter_map(|product| product.brand_name.as_deref())
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut dates = BTreeSet::new();
    for submission in &raw.submissions {
        let Some(value) = submission.submission_status_date.as_deref() else {
            continue;
        };
        match parse_submission_date(value) {
            Ok(date) => {
                dates.insert(date);
            }
            Err(err) => warn!(%application_number, error = %err, "submission date dropped"),
        }
    }
    if dates.is_empty() {
        warn!(%application_number, "approval record without valid submission dates skipped");
        return None;
    }

    Some(DrugMeta {
        company: raw
            .sponsor_name
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_lowercase(),
        application_number,
        products: products.into_iter().collect(),
        date: dates.into_iter().collect(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeSummary {
    pub received: usize,
    pub normalized: usize,
    pub skipped: usize,
    pub drugs_meta: WriteSummary,
    pub ingredients: WriteSummary,
}

/// Normalizes the feed and upserts it batch by batch into the approval
/// and all-drugs collections.
pub fn store_approvals(
    store: &Store,
    approvals: &[RawApproval],
    batch_size: usize,
) -> Result<NormalizeSummary, LyoError> {
    let mut summary = NormalizeSummary {
        received: approvals.len(),
        ..NormalizeSummary::default()
    };

    for (index, chunk) in approvals.chunks(batch_size.max(1)).enumerate() {
        let metas: Vec<DrugMeta> = chunk.iter().filter_map(normalize).collect();
        summary.skipped += chunk.len() - metas.len();
        summary.normalized += metas.len();

        let records: Vec<DrugRecord> = metas.iter().map(DrugMeta::to_drug_record).collect();
        summary
            .drugs_meta
            .absorb(store.upsert_many(Collection::DrugsMeta, &metas)?);
        summary
            .ingredients
            .absorb(store.upsert_many(Collection::Ingredients, &records)?);
        info!(batch = index + 1, records = metas.len(), "approval batch stored");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{RawProduct, RawSubmission};

    fn raw(number: Option<&str>, dates: &[&str]) -> RawApproval {
        RawApproval {
            application_number: number.map(str::to_string),
            sponsor_name: Some("ACME Pharma".to_string()),
            products: vec![
                RawProduct {
                    brand_name: Some("Zeta".to_string()),
                },
                RawProduct {
                    brand_name: Some("ALPHA".to_string()),
                },
                RawProduct {
                    brand_name: Some("zeta".to_string()),
                },
                RawProduct { brand_name: None },
            ],
            submissions: dates
                .iter()
                .map(|date| RawSubmission {
                    submission_status_date: Some(date.to_string()),
                })
                .collect(),
        }
    }

    #[test]
    fn normalizes_names_and_dates() {
        let meta = normalize(&raw(Some("NDA000001"), &["20210301", "bad", "20200115", "20200115"]))
            .unwrap();
        assert_eq!(meta.company, "acme pharma");
        assert_eq!(meta.products, vec!["alpha", "zeta"]);
        assert_eq!(
            meta.date,
            vec![
                NaiveDate::from_ymd_opt(2020, 1, 15).unwrap(),
                NaiveDate::from_ymd_opt(2021, 3, 1).unwrap(),
            ]
        );
    }

    #[test]
    fn skips_undated_and_unkeyed_records() {
        assert!(normalize(&raw(Some("NDA000001"), &["2020-01-15"])).is_none());
        assert!(normalize(&raw(None, &["20200115"])).is_none());
    }
}
