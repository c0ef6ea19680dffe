use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{Urls, fill_template};
use crate::dailymed::DailyMedClient;
use crate::domain::{ApplicationNumber, DrugRecord, Lyophilized, SetId};
use crate::error::LyoError;
use crate::retry::RetryPolicy;
use crate::store::{Collection, Filter, Query, Store, WriteSummary};

static SETID_IN_HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"setid=([^&#]+)").expect("valid set-id pattern"));

const DRUG_LINK_SELECTOR: &str = "a.drug-info-link";

/// Application number → label ids that prove the drug is lyophilized.
pub type Corrections = BTreeMap<ApplicationNumber, Vec<SetId>>;

/// Label ids linked from one search result page, in page order.
pub fn extract_set_ids(html: &str) -> Result<Vec<SetId>, LyoError> {
    let selector = Selector::parse(DRUG_LINK_SELECTOR)
        .map_err(|err| LyoError::parse("drug link selector", err))?;
    let document = Html::parse_document(html);

    let mut ids = Vec::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Some(captures) = SETID_IN_HREF.captures(href) else {
            continue;
        };
        match captures[1].parse::<SetId>() {
            Ok(setid) => ids.push(setid),
            Err(err) => debug!(%href, error = %err, "drug link without usable set id"),
        }
    }
    Ok(ids)
}

pub struct ReconcileScanner<'a, C: DailyMedClient> {
    client: C,
    urls: &'a Urls,
    retry: RetryPolicy,
}

impl<'a, C: DailyMedClient> ReconcileScanner<'a, C> {
    pub fn new(client: C, urls: &'a Urls) -> Self {
        Self {
            client,
            urls,
            retry: RetryPolicy::http(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Label ids listed by either lyophilized search.
    pub fn scan(&self) -> BTreeSet<SetId> {
        let mut found = BTreeSet::new();
        for (name, template) in [
            ("dosage form", &self.urls.lyophilized_from_dosage),
            ("description", &self.urls.lyophilized_from_description),
        ] {
            let endpoint = self.scan_endpoint(template);
            let before = found.len();
            found.extend(endpoint);
            info!(endpoint = name, new = found.len() - before, "lyophilized search scanned");
        }
        found
    }

    /// Pages through one search until a page lists nothing this endpoint has
    /// not already listed. A page that keeps failing ends the scan of this
    /// endpoint only.
    pub fn scan_endpoint(&self, template: &str) -> BTreeSet<SetId> {
        let mut seen = BTreeSet::new();
        let mut page = 1usize;
        loop {
            let url = fill_template(template, &[&page.to_string()]);
            let html = match self
                .retry
                .run(|| self.client.fetch_search_page(&url), LyoError::is_transient_network)
            {
                Ok(html) => html,
                Err(err) => {
                    error!(%url, error = %err, "search page failed, endpoint scan stopped");
                    break;
                }
            };
            let ids = match extract_set_ids(&html) {
                Ok(ids) => ids,
                Err(err) => {
                    error!(%url, error = %err, "search page unreadable, endpoint scan stopped");
                    break;
                }
            };

            let mut added = 0usize;
            for id in ids {
                if seen.insert(id) {
                    added += 1;
                }
            }
            debug!(page, added, "search page scanned");
            if added == 0 {
                break;
            }
            page += 1;
        }
        seen
    }
}

/// Drugs whose label map holds a scraped id but which are not classified
/// lyophilized yet.
pub fn find_corrections(store: &Store, scraped: &BTreeSet<SetId>) -> Result<Corrections, LyoError> {
    let mut corrections = Corrections::new();
    let query = Query::all().filter(Filter::Exists("set_ids".to_string()));
    for record in store.find_as::<DrugRecord>(Collection::Ingredients, query) {
        let record = record?;
        if record.classification().is_lyophilized() {
            continue;
        }
        let (Some(application_number), Some(set_ids)) = (record.id, record.set_ids) else {
            continue;
        };
        let matched: Vec<SetId> = set_ids
            .into_keys()
            .filter(|setid| scraped.contains(setid))
            .collect();
        if !matched.is_empty() {
            corrections.insert(application_number, matched);
        }
    }
    info!(drugs = corrections.len(), "reconciliation corrections found");
    Ok(corrections)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorrectionSummary {
    pub corrected: usize,
    pub ingredients: WriteSummary,
    pub lyophilized: WriteSummary,
}

/// Marks every corrected drug lyophilized and copies its full record into
/// the lyophilized collection.
pub fn apply_corrections(
    store: &Store,
    corrections: &Corrections,
) -> Result<CorrectionSummary, LyoError> {
    let mut summary = CorrectionSummary::default();
    for (application_number, setids) in corrections {
        let patch = DrugRecord {
            lyophilized: Some(Lyophilized::Lyophilized),
            ..DrugRecord::keyed(application_number.clone())
        };
        summary
            .ingredients
            .absorb(store.upsert_many(Collection::Ingredients, &[patch])?);

        let Some(document) = store.get(Collection::Ingredients, application_number.as_str())?
        else {
            warn!(%application_number, "corrected drug vanished from the all-drugs collection");
            continue;
        };
        summary
            .lyophilized
            .absorb(store.upsert_documents(Collection::Lyophilized, &[document])?);
        summary.corrected += 1;
        info!(%application_number, labels = setids.len(), "drug reclassified as lyophilized");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_id_ends_at_query_or_fragment() {
        let html = r#"<html><body>
            <a class="drug-info-link" href="/dailymed/drugInfo.cfm?setid=ab12-cd34&audience=consumer">x</a>
            <a class="drug-info-link" href="/dailymed/drugInfo.cfm?setid=ef56#top">y</a>
            <a class="other-link" href="/dailymed/drugInfo.cfm?setid=0000">z</a>
            <a class="drug-info-link" href="/dailymed/search.cfm">no id</a>
        </body></html>"#;
        let ids = extract_set_ids(html).unwrap();
        let ids: Vec<&str> = ids.iter().map(SetId::as_str).collect();
        assert_eq!(ids, vec!["ab12-cd34", "ef56"]);
    }
}
