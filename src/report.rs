//! Read side of the lyophilized collection: the rows, search lists and
//! ingredient time series a dashboard renders.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::domain::{DrugRecord, IngredientEntry, SetId};
use crate::error::LyoError;
use crate::store::{Collection, Filter, Query, Store};

const DISPLAY_DATE_FORMAT: &str = "%m-%d-%Y";

pub fn default_table_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2022, 1, 1).unwrap_or_default()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableQuery {
    pub products: Vec<String>,
    pub active: Vec<String>,
    pub inactive: Vec<String>,
    pub from: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
}

impl TableQuery {
    /// Only the first non-empty search list applies: products, then active
    /// names, then inactive names.
    fn search_filter(&self) -> Option<Filter> {
        let lowered = |values: &[String]| -> Vec<String> {
            values.iter().map(|v| v.trim().to_lowercase()).collect()
        };
        if !self.products.is_empty() {
            Some(Filter::ContainsAny("products".to_string(), lowered(&self.products)))
        } else if !self.active.is_empty() {
            Some(Filter::ContainsAny(
                "active_ingredients_list".to_string(),
                lowered(&self.active),
            ))
        } else if !self.inactive.is_empty() {
            Some(Filter::ContainsAny(
                "inactive_ingredients_list".to_string(),
                lowered(&self.inactive),
            ))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngredientCell {
    pub name: String,
    pub strength: String,
}

impl From<&IngredientEntry> for IngredientCell {
    fn from(entry: &IngredientEntry) -> Self {
        Self {
            name: entry.name.clone(),
            strength: entry.strength.clone(),
        }
    }
}

/// The n-th active ingredient next to the n-th inactive one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngredientPair {
    pub active: Option<IngredientCell>,
    pub inactive: Option<IngredientCell>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRow {
    pub application_number: String,
    pub company: String,
    pub products: Vec<String>,
    pub dates: Vec<String>,
    pub label_title: String,
    pub label_url: String,
    pub ingredients: Vec<IngredientPair>,
}

/// One row per lyophilized drug and label that has ingredients, ordered by
/// first submission date.
pub fn table_rows(store: &Store, request: &TableQuery) -> Result<Vec<TableRow>, LyoError> {
    let search = request.search_filter();
    let from = match (request.from, &search) {
        (Some(from), _) => Some(from),
        (None, None) => Some(default_table_start()),
        (None, Some(_)) => None,
    };

    let mut query = Query::all().sorted_by_date();
    if let Some(filter) = search {
        query = query.filter(filter);
    }
    if from.is_some() || request.until.is_some() {
        query = query.filter(Filter::DateRange {
            field: "date".to_string(),
            from,
            until: request.until,
        });
    }

    let mut rows = Vec::new();
    for record in store.find_as::<DrugRecord>(Collection::Lyophilized, query) {
        let record = record?;
        let dates = displayed_dates(&record, from, request.until);
        let application_number = record
            .application_number
            .as_ref()
            .or(record.id.as_ref())
            .map(|number| number.to_string())
            .unwrap_or_default();
        let products: Vec<String> = record
            .products
            .iter()
            .flatten()
            .map(|product| product.to_uppercase())
            .collect();

        for (setid, label) in record.set_ids.iter().flatten() {
            let active = label_entries(record.active_ingredients.as_ref(), setid);
            let inactive = label_entries(record.inactive_ingredients.as_ref(), setid);
            let span = active.len().max(inactive.len());
            if span == 0 {
                continue;
            }
            let ingredients = (0..span)
                .map(|i| IngredientPair {
                    active: active.get(i).map(IngredientCell::from),
                    inactive: inactive.get(i).map(IngredientCell::from),
                })
                .collect();
            rows.push(TableRow {
                application_number: application_number.clone(),
                company: record.company.clone().unwrap_or_default(),
                products: products.clone(),
                dates: dates.clone(),
                label_title: label.title.clone(),
                label_url: label.web_url.clone(),
                ingredients,
            });
        }
    }
    Ok(rows)
}

fn label_entries<'a>(
    lists: Option<&'a BTreeMap<SetId, Vec<IngredientEntry>>>,
    setid: &SetId,
) -> &'a [IngredientEntry] {
    lists
        .and_then(|lists| lists.get(setid))
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Every date without a start bound, otherwise the first date inside the
/// window.
fn displayed_dates(
    record: &DrugRecord,
    from: Option<NaiveDate>,
    until: Option<NaiveDate>,
) -> Vec<String> {
    let dates = record.date.iter().flatten().copied();
    let format = |date: NaiveDate| date.format(DISPLAY_DATE_FORMAT).to_string();
    match from {
        None => dates.map(format).collect(),
        Some(from) => dates
            .filter(|date| *date >= from && until.is_none_or(|until| *date < until))
            .map(format)
            .take(1)
            .collect(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchBarData {
    pub products: Vec<String>,
    pub active_ingredients: Vec<String>,
    pub inactive_ingredients: Vec<String>,
}

pub fn search_bar_data(store: &Store) -> Result<SearchBarData, LyoError> {
    let mut products = BTreeSet::new();
    let mut active = BTreeSet::new();
    let mut inactive = BTreeSet::new();
    for record in store.find_as::<DrugRecord>(Collection::Lyophilized, Query::all()) {
        let record = record?;
        products.extend(record.products.unwrap_or_default());
        active.extend(record.active_ingredients_list.unwrap_or_default());
        inactive.extend(record.inactive_ingredients_list.unwrap_or_default());
    }
    Ok(SearchBarData {
        products: products.into_iter().collect(),
        active_ingredients: active.into_iter().collect(),
        inactive_ingredients: inactive.into_iter().collect(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngredientOccurrence {
    pub by_year: BTreeMap<i32, usize>,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Occurrences {
    pub active: BTreeMap<String, IngredientOccurrence>,
    pub inactive: BTreeMap<String, IngredientOccurrence>,
}

/// Counts, per ingredient, the products that use it, bucketed by the year
/// of the drug's first submission. A product and ingredient pair counts
/// once per class even when several drugs share it. Active and inactive
/// pairs are tracked separately, so an ingredient a product lists both as
/// active and as inactive shows up in both series.
pub fn ingredient_occurrences(store: &Store) -> Result<Occurrences, LyoError> {
    let mut occurrences = Occurrences::default();
    let mut seen_active = HashSet::new();
    let mut seen_inactive = HashSet::new();

    for record in store.find_as::<DrugRecord>(Collection::Lyophilized, Query::all()) {
        let record = record?;
        let Some(year) = record.first_date().map(|date| date.year()) else {
            continue;
        };
        let products = record.products.as_deref().unwrap_or_default();
        tally(
            &mut occurrences.active,
            &mut seen_active,
            products,
            record.active_ingredients_list.as_deref().unwrap_or_default(),
            year,
        );
        tally(
            &mut occurrences.inactive,
            &mut seen_inactive,
            products,
            record.inactive_ingredients_list.as_deref().unwrap_or_default(),
            year,
        );
    }
    Ok(occurrences)
}

fn tally(
    counts: &mut BTreeMap<String, IngredientOccurrence>,
    seen: &mut HashSet<(String, String)>,
    products: &[String],
    ingredients: &[String],
    year: i32,
) {
    for product in products {
        for ingredient in ingredients {
            if !seen.insert((product.clone(), ingredient.clone())) {
                continue;
            }
            let entry = counts.entry(ingredient.clone()).or_default();
            *entry.by_year.entry(year).or_default() += 1;
            entry.total += 1;
        }
    }
}
