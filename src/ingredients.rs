use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{Urls, fill_template};
use crate::dailymed::DailyMedClient;
use crate::domain::{
    ApplicationNumber, DrugRecord, IngredientClass, IngredientEntry, LYOPHILIZED,
    LabelIngredientSet, SetId,
};
use crate::error::LyoError;
use crate::spl::{XmlNode, parse_document};
use crate::store::{Collection, Query, Store, WriteSummary};

/// An ingredient as listed in the SPL, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplIngredient {
    pub class_code: String,
    pub entry: IngredientEntry,
}

/// One product presentation inside a label: either a whole manufactured
/// product or one part of a kit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductGroup {
    pub form_display_name: String,
    pub sequence_index: usize,
    pub ingredients: Vec<SplIngredient>,
    pub is_lyophilized_tagged: bool,
}

impl ProductGroup {
    fn new(form_display_name: String, sequence_index: usize, ingredients: Vec<SplIngredient>) -> Self {
        let is_lyophilized_tagged = form_display_name.contains(LYOPHILIZED);
        Self {
            form_display_name,
            sequence_index,
            ingredients,
            is_lyophilized_tagged,
        }
    }

    pub fn key(&self) -> String {
        format!("{}_{}", self.form_display_name, self.sequence_index)
    }
}

/// Numerator/denominator strength text.
///
/// A denominator of `"11"` (value `1`, unit `1`) is a placeholder in the
/// source data and is treated as absent.
pub fn format_strength(
    numerator_value: &str,
    numerator_unit: &str,
    denominator_value: &str,
    denominator_unit: &str,
) -> String {
    if [numerator_value, numerator_unit, denominator_value, denominator_unit]
        .iter()
        .all(|part| part.is_empty())
    {
        return String::new();
    }
    let numerator = format!("{numerator_value}{numerator_unit}");
    let denominator = format!("{denominator_value}{denominator_unit}");
    if denominator.is_empty() || denominator == "11" {
        numerator
    } else {
        format!("{numerator} in {denominator}")
    }
}

pub fn parse_ingredient(node: &XmlNode) -> SplIngredient {
    let quantity = node.child("quantity");
    let strength = format_strength(
        quantity_part(quantity, "numerator", "value"),
        quantity_part(quantity, "numerator", "unit"),
        quantity_part(quantity, "denominator", "value"),
        quantity_part(quantity, "denominator", "unit"),
    );

    let substance = node.child("ingredientSubstance");
    let code = substance
        .and_then(|s| s.child("code"))
        .and_then(|c| c.attr("code"))
        .unwrap_or("")
        .to_string();
    let name = substance
        .and_then(|s| s.child("name"))
        .map(|n| n.text().to_lowercase())
        .unwrap_or_default();

    SplIngredient {
        class_code: node.attr("classCode").unwrap_or("").to_string(),
        entry: IngredientEntry {
            name,
            code,
            strength,
        },
    }
}

fn quantity_part<'a>(quantity: Option<&'a XmlNode>, name: &str, attr: &str) -> &'a str {
    quantity
        .and_then(|q| q.child(name))
        .and_then(|n| n.attr(attr))
        .unwrap_or("")
}

fn display_name(product: &XmlNode) -> String {
    product
        .child("formCode")
        .and_then(|form| form.attr("displayName"))
        .unwrap_or("")
        .to_lowercase()
}

/// Walks `component/section/subject/manufacturedProduct` in document order
/// and numbers every presentation with one counter across the document.
pub fn collect_product_groups(document: &XmlNode) -> Vec<ProductGroup> {
    let mut groups = Vec::new();
    let Some(body) = document.path(&["component", "structuredBody"]) else {
        return groups;
    };

    let mut sequence = 0usize;
    for component in body.children_named("component") {
        let Some(section) = component.child("section") else {
            continue;
        };
        for subject in section.children_named("subject") {
            let Some(product) = subject.path(&["manufacturedProduct", "manufacturedProduct"]) else {
                continue;
            };
            let direct: Vec<SplIngredient> = product
                .children_named("ingredient")
                .map(parse_ingredient)
                .collect();
            if !direct.is_empty() {
                groups.push(ProductGroup::new(display_name(product), sequence, direct));
                sequence += 1;
                continue;
            }
            for part in product.children_named("part") {
                let part_product = part.child("partProduct");
                let name = part_product.map(display_name).unwrap_or_default();
                let ingredients: Vec<SplIngredient> = part_product
                    .map(|p| p.children_named("ingredient").map(parse_ingredient).collect())
                    .unwrap_or_default();
                groups.push(ProductGroup::new(name, sequence, ingredients));
                sequence += 1;
            }
        }
    }
    groups
}

/// With several presentations and at least one lyophilized one, only the
/// lyophilized presentations count. Otherwise everything is kept.
pub fn select_groups(groups: Vec<ProductGroup>) -> Vec<ProductGroup> {
    let has_lyophilized = groups.iter().any(|group| group.is_lyophilized_tagged);
    if groups.len() > 1 && has_lyophilized {
        groups
            .into_iter()
            .filter(|group| group.is_lyophilized_tagged)
            .collect()
    } else {
        groups
    }
}

#[derive(Default)]
struct Accumulator {
    set: LabelIngredientSet,
    seen_active: HashSet<String>,
    seen_inactive: HashSet<String>,
}

impl Accumulator {
    fn push(&mut self, ingredient: SplIngredient) {
        let key = ingredient.entry.dedup_key();
        match IngredientClass::from_class_code(&ingredient.class_code) {
            Some(IngredientClass::Active) => {
                if self.seen_active.insert(key) {
                    self.set.active.push(ingredient.entry);
                }
            }
            Some(IngredientClass::Inactive) => {
                if self.seen_inactive.insert(key) {
                    self.set.inactive.push(ingredient.entry);
                }
            }
            None => {}
        }
    }
}

pub fn ingredients_from_document(document: &XmlNode) -> LabelIngredientSet {
    let groups = select_groups(collect_product_groups(document));
    let mut acc = Accumulator::default();
    for group in groups {
        debug!(group = %group.key(), count = group.ingredients.len(), "ingredient group kept");
        for ingredient in group.ingredients {
            acc.push(ingredient);
        }
    }
    acc.set
}

/// Malformed XML yields an empty set for the label instead of an error.
pub fn ingredients_from_xml(setid: &SetId, xml: &str) -> LabelIngredientSet {
    match parse_document(xml) {
        Ok(document) => ingredients_from_document(&document),
        Err(err) => {
            error!(%setid, error = %err, "error while parsing SPL document");
            LabelIngredientSet::default()
        }
    }
}

/// Ingredients of one drug across all of its labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrugIngredients {
    pub active: BTreeMap<SetId, Vec<IngredientEntry>>,
    pub inactive: BTreeMap<SetId, Vec<IngredientEntry>>,
    pub active_names: Vec<String>,
    pub inactive_names: Vec<String>,
}

impl DrugIngredients {
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.inactive.is_empty()
    }

    pub fn from_labels(labels: BTreeMap<SetId, LabelIngredientSet>) -> Self {
        let mut active = BTreeMap::new();
        let mut inactive = BTreeMap::new();
        for (setid, set) in labels {
            active.insert(setid.clone(), set.active);
            inactive.insert(setid, set.inactive);
        }
        Self::from_maps(active, inactive)
    }

    /// Rebuilds the sorted name caches from the per-label lists.
    pub fn from_maps(
        active: BTreeMap<SetId, Vec<IngredientEntry>>,
        inactive: BTreeMap<SetId, Vec<IngredientEntry>>,
    ) -> Self {
        Self {
            active_names: distinct_names(&active),
            inactive_names: distinct_names(&inactive),
            active,
            inactive,
        }
    }

    /// Overlays freshly extracted labels on what `record` already holds.
    /// Stored labels that are no longer in the record's label map are
    /// dropped.
    pub fn merge(record: &DrugRecord, labels: BTreeMap<SetId, LabelIngredientSet>) -> Self {
        let keep = |setid: &SetId| {
            record
                .set_ids
                .as_ref()
                .is_none_or(|set_ids| set_ids.contains_key(setid))
        };
        let mut active: BTreeMap<SetId, Vec<IngredientEntry>> = record
            .active_ingredients
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|(setid, _)| keep(setid))
            .collect();
        let mut inactive: BTreeMap<SetId, Vec<IngredientEntry>> = record
            .inactive_ingredients
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|(setid, _)| keep(setid))
            .collect();
        for (setid, set) in labels {
            active.insert(setid.clone(), set.active);
            inactive.insert(setid, set.inactive);
        }
        Self::from_maps(active, inactive)
    }

    pub fn into_patch(self, id: ApplicationNumber) -> DrugRecord {
        DrugRecord {
            active_ingredients: Some(self.active),
            inactive_ingredients: Some(self.inactive),
            active_ingredients_list: Some(self.active_names),
            inactive_ingredients_list: Some(self.inactive_names),
            ..DrugRecord::keyed(id)
        }
    }
}

fn distinct_names(lists: &BTreeMap<SetId, Vec<IngredientEntry>>) -> Vec<String> {
    lists
        .values()
        .flatten()
        .filter(|entry| !entry.name.is_empty())
        .map(|entry| entry.name.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Outcome of extracting a set of labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelBatch {
    pub labels: BTreeMap<SetId, LabelIngredientSet>,
    pub failed: Vec<SetId>,
}

pub struct IngredientExtractor<'a, C: DailyMedClient> {
    client: C,
    urls: &'a Urls,
}

impl<'a, C: DailyMedClient> IngredientExtractor<'a, C> {
    pub fn new(client: C, urls: &'a Urls) -> Self {
        Self { client, urls }
    }

    pub fn document_url(&self, setid: &SetId) -> String {
        fill_template(&self.urls.spl_document, &[setid.as_str()])
    }

    /// Fetch failures are returned; parse failures give an empty set.
    pub fn extract(&self, setid: &SetId) -> Result<LabelIngredientSet, LyoError> {
        let url = self.document_url(setid);
        let xml = self
            .client
            .fetch_spl_document(&url)
            .inspect_err(|err| error!(%setid, error = %err, "failed to get SPL document"))?;
        Ok(ingredients_from_xml(setid, &xml))
    }

    /// Extracts every label in `setids`. Labels that cannot be fetched are
    /// reported in `failed`; the rest still count.
    pub fn extract_labels<'s, I>(&self, setids: I) -> LabelBatch
    where
        I: IntoIterator<Item = &'s SetId>,
    {
        let mut batch = LabelBatch::default();
        for setid in setids {
            match self.extract(setid) {
                Ok(set) => {
                    batch.labels.insert(setid.clone(), set);
                }
                Err(err) => {
                    warn!(%setid, error = %err, "label skipped");
                    batch.failed.push(setid.clone());
                }
            }
        }
        batch
    }
}

/// Which lyophilized drugs an extraction pass covers.
#[derive(Debug, Clone, Copy)]
pub enum ExtractionScope<'a> {
    /// Every label of every drug in the lyophilized collection.
    AllLyophilized,
    /// Only the listed labels of the listed drugs.
    Labels(&'a BTreeMap<ApplicationNumber, Vec<SetId>>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionSummary {
    pub drugs: usize,
    pub labels: usize,
    pub failed_labels: usize,
    pub written: WriteSummary,
}

/// Extracts ingredients for the drugs in `scope` and stores the per-label
/// lists and name caches in the lyophilized collection.
pub fn extract_into_store<C: DailyMedClient>(
    store: &Store,
    extractor: &IngredientExtractor<'_, C>,
    scope: ExtractionScope<'_>,
    progress_every: usize,
) -> Result<ExtractionSummary, LyoError> {
    info!(?scope, "extracting ingredients");
    let mut summary = ExtractionSummary::default();
    let mut processed = 0usize;
    let mut progress = || {
        processed += 1;
        if processed % progress_every.max(1) == 0 {
            info!(processed, "ingredient extraction progress");
        }
    };

    match scope {
        ExtractionScope::AllLyophilized => {
            for record in store.find_as::<DrugRecord>(Collection::Lyophilized, Query::all()) {
                let record = record?;
                progress();
                let setids: Vec<SetId> = record
                    .set_ids
                    .as_ref()
                    .map(|set_ids| set_ids.keys().cloned().collect())
                    .unwrap_or_default();
                extract_drug(store, extractor, &record, &setids, &mut summary)?;
            }
        }
        ExtractionScope::Labels(corrections) => {
            for (application_number, setids) in corrections {
                progress();
                let record = store
                    .get_as::<DrugRecord>(Collection::Lyophilized, application_number.as_str())?
                    .unwrap_or_else(|| DrugRecord::keyed(application_number.clone()));
                extract_drug(store, extractor, &record, setids, &mut summary)?;
            }
        }
    }

    info!(
        drugs = summary.drugs,
        labels = summary.labels,
        failed = summary.failed_labels,
        "ingredient extraction finished"
    );
    Ok(summary)
}

fn extract_drug<C: DailyMedClient>(
    store: &Store,
    extractor: &IngredientExtractor<'_, C>,
    record: &DrugRecord,
    setids: &[SetId],
    summary: &mut ExtractionSummary,
) -> Result<(), LyoError> {
    let Some(application_number) = record.id.clone() else {
        return Ok(());
    };
    if setids.is_empty() {
        debug!(%application_number, "no labels to extract");
        return Ok(());
    }

    let batch = extractor.extract_labels(setids);
    summary.labels += batch.labels.len();
    summary.failed_labels += batch.failed.len();
    if batch.labels.is_empty() {
        return Ok(());
    }
    let patch = DrugIngredients::merge(record, batch.labels).into_patch(application_number);
    summary
        .written
        .absorb(store.upsert_many(Collection::Lyophilized, &[patch])?);
    summary.drugs += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_denominator_is_dropped() {
        assert_eq!(format_strength("10", "mg", "1", "1"), "10mg");
        assert_eq!(format_strength("10", "mg", "", ""), "10mg");
        assert_eq!(format_strength("10", "mg", "1", "mL"), "10mg in 1mL");
        assert_eq!(format_strength("", "", "", ""), "");
    }

    #[test]
    fn group_key_combines_name_and_index() {
        let group = ProductGroup::new("lyophilized powder".to_string(), 3, Vec::new());
        assert_eq!(group.key(), "lyophilized powder_3");
        assert!(group.is_lyophilized_tagged);
    }

    #[test]
    fn single_group_is_kept_regardless_of_name() {
        let groups = vec![ProductGroup::new("injection, solution".to_string(), 0, Vec::new())];
        assert_eq!(select_groups(groups).len(), 1);
    }

    #[test]
    fn untagged_groups_are_all_kept() {
        let groups = vec![
            ProductGroup::new("tablet".to_string(), 0, Vec::new()),
            ProductGroup::new("capsule".to_string(), 1, Vec::new()),
        ];
        assert_eq!(select_groups(groups).len(), 2);
    }

    #[test]
    fn lyophilized_groups_win_over_diluent() {
        let groups = vec![
            ProductGroup::new("injection, powder, lyophilized, for solution".to_string(), 0, Vec::new()),
            ProductGroup::new("injection, solution".to_string(), 1, Vec::new()),
        ];
        let kept = select_groups(groups);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].sequence_index, 0);
    }
}
