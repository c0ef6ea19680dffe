use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{Urls, fill_template};
use crate::dailymed::{DailyMedClient, SetIdEntry};
use crate::domain::{ApplicationNumber, DrugRecord, LYOPHILIZED, LabelRef, Lyophilized, SetId};
use crate::error::LyoError;
use crate::store::{Collection, Filter, Query, Store, WriteSummary};

pub const SET_ID_PAGE_SIZE: usize = 1000;

/// The cursor value DailyMed sends on the last page.
const LAST_PAGE_MARKER: &str = "null";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelResolution {
    pub labels: BTreeMap<SetId, LabelRef>,
    pub lyophilized: Lyophilized,
}

/// Any lyophilized title wins; no labels at all means unknown.
pub fn classify<'a, I>(titles: I) -> Lyophilized
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen_any = false;
    for title in titles {
        if title.to_lowercase().contains(LYOPHILIZED) {
            return Lyophilized::Lyophilized;
        }
        seen_any = true;
    }
    if seen_any {
        Lyophilized::NotLyophilized
    } else {
        Lyophilized::Unknown
    }
}

/// Which drugs a resolver pass visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveScope {
    /// Drugs that have no label map yet.
    #[default]
    Missing,
    All,
}

pub struct LabelResolver<'a, C: DailyMedClient> {
    client: C,
    urls: &'a Urls,
}

impl<'a, C: DailyMedClient> LabelResolver<'a, C> {
    pub fn new(client: C, urls: &'a Urls) -> Self {
        Self { client, urls }
    }

    pub fn first_page_url(&self, application_number: &ApplicationNumber) -> String {
        fill_template(
            &self.urls.spl_set_id,
            &[
                application_number.as_str(),
                "1",
                &SET_ID_PAGE_SIZE.to_string(),
            ],
        )
    }

    pub fn web_url(&self, setid: &SetId) -> String {
        fill_template(&self.urls.dailymed_webpage, &[setid.as_str()])
    }

    /// Walks every page of the set-id search for one application number.
    pub fn resolve(
        &self,
        application_number: &ApplicationNumber,
    ) -> Result<LabelResolution, LyoError> {
        let mut labels = BTreeMap::new();
        let mut visited = HashSet::new();
        let mut next = Some(self.first_page_url(application_number));

        while let Some(url) = next.take() {
            if !visited.insert(url.clone()) {
                warn!(%application_number, %url, "set-id pagination revisited a page");
                break;
            }
            let page = self.client.fetch_set_id_page(&url)?;
            for entry in &page.data {
                if let Some((setid, label)) = self.label_from_entry(application_number, entry) {
                    labels.insert(setid, label);
                }
            }
            next = page
                .metadata
                .next_page_url
                .filter(|cursor| !cursor.is_empty() && cursor != LAST_PAGE_MARKER);
        }

        let lyophilized = classify(labels.values().map(|label| label.title.as_str()));
        debug!(%application_number, labels = labels.len(), %lyophilized, "labels resolved");
        Ok(LabelResolution {
            labels,
            lyophilized,
        })
    }

    fn label_from_entry(
        &self,
        application_number: &ApplicationNumber,
        entry: &SetIdEntry,
    ) -> Option<(SetId, LabelRef)> {
        let (Some(raw_setid), Some(title)) = (entry.setid.as_deref(), entry.title.as_deref())
        else {
            warn!(%application_number, "set-id entry without setid or title skipped");
            return None;
        };
        let setid = match raw_setid.parse::<SetId>() {
            Ok(setid) => setid,
            Err(err) => {
                warn!(%application_number, error = %err, "set-id entry skipped");
                return None;
            }
        };
        let label = LabelRef {
            title: title.to_lowercase(),
            web_url: self.web_url(&setid),
        };
        Some((setid, label))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LabelStageSummary {
    pub considered: usize,
    pub resolved: usize,
    pub failed: usize,
    pub lyophilized: usize,
    pub not_lyophilized: usize,
    pub unknown: usize,
    pub written: WriteSummary,
}

/// Resolves labels for the drugs in `scope` and writes the label map and
/// classification back to the all-drugs collection, one drug at a time.
pub fn resolve_into_store<C: DailyMedClient>(
    store: &Store,
    resolver: &LabelResolver<'_, C>,
    scope: ResolveScope,
    progress_every: usize,
) -> Result<LabelStageSummary, LyoError> {
    let query = match scope {
        ResolveScope::Missing => Query::all().filter(Filter::Missing("set_ids".to_string())),
        ResolveScope::All => Query::all(),
    };
    info!(?scope, "resolving labels");

    let mut summary = LabelStageSummary::default();
    for record in store.find_as::<DrugRecord>(Collection::Ingredients, query) {
        let record = record?;
        summary.considered += 1;
        if summary.considered % progress_every.max(1) == 0 {
            info!(processed = summary.considered, "label resolution progress");
        }
        let Some(application_number) = record.id else {
            continue;
        };
        let stored = record.lyophilized.unwrap_or_default();
        let resolution = match resolver.resolve(&application_number) {
            Ok(resolution) => resolution,
            Err(err) => {
                error!(%application_number, error = %err, "label resolution failed");
                summary.failed += 1;
                continue;
            }
        };

        let lyophilized = stored.promote(resolution.lyophilized);
        match lyophilized {
            Lyophilized::Lyophilized => summary.lyophilized += 1,
            Lyophilized::NotLyophilized => summary.not_lyophilized += 1,
            Lyophilized::Unknown => summary.unknown += 1,
        }
        let patch = DrugRecord {
            set_ids: Some(resolution.labels),
            lyophilized: Some(lyophilized),
            ..DrugRecord::keyed(application_number)
        };
        summary
            .written
            .absorb(store.upsert_many(Collection::Ingredients, &[patch])?);
        summary.resolved += 1;
    }
    info!(
        considered = summary.considered,
        resolved = summary.resolved,
        failed = summary.failed,
        "label resolution finished"
    );
    Ok(summary)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CopySummary {
    pub copied: usize,
    pub written: WriteSummary,
}

/// Copies every lyophilized record of the all-drugs collection into the
/// lyophilized collection.
pub fn copy_lyophilized(store: &Store, batch_size: usize) -> Result<CopySummary, LyoError> {
    let batch_size = batch_size.max(1);
    let mut summary = CopySummary::default();
    let mut batch = Vec::with_capacity(batch_size);
    for document in store.find(
        Collection::Ingredients,
        Query::all().filter(Filter::eq("lyophilized", true)),
    ) {
        batch.push(document?);
        if batch.len() == batch_size {
            summary.copied += batch.len();
            summary
                .written
                .absorb(store.upsert_documents(Collection::Lyophilized, &batch)?);
            batch.clear();
        }
    }
    if !batch.is_empty() {
        summary.copied += batch.len();
        summary
            .written
            .absorb(store.upsert_documents(Collection::Lyophilized, &batch)?);
    }
    info!(copied = summary.copied, "lyophilized drugs copied");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_from_titles() {
        assert_eq!(classify(Vec::<&str>::new()), Lyophilized::Unknown);
        assert_eq!(
            classify(["DRUG injection, solution", "drug (LYOPHILIZED) powder"]),
            Lyophilized::Lyophilized
        );
        assert_eq!(classify(["drug tablet"]), Lyophilized::NotLyophilized);
    }
}
