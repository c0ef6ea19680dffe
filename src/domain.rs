use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::LyoError;

pub const LYOPHILIZED: &str = "lyophilized";

/// FDA application number (`NDA021436`, `ANDA076543`, `BLA125057`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationNumber(String);

impl ApplicationNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApplicationNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ApplicationNumber {
    type Err = LyoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let is_valid = !normalized.is_empty()
            && normalized.chars().all(|ch| ch.is_ascii_alphanumeric())
            && normalized.chars().any(|ch| ch.is_ascii_digit());
        if !is_valid {
            return Err(LyoError::InvalidApplicationNumber(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// DailyMed SPL set id, a lower-case UUID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SetId(String);

impl SetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SetId {
    type Err = LyoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_hexdigit() || ch == '-');
        if !is_valid {
            return Err(LyoError::InvalidSetId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Lyophilized classification of a drug.
///
/// Stored as `true`, `false` or `"N/A"` so existing consumers of the
/// collections keep working; anything unrecognised reads back as `Unknown`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "LyophilizedWire", into = "LyophilizedWire")]
pub enum Lyophilized {
    Lyophilized,
    NotLyophilized,
    #[default]
    Unknown,
}

impl Lyophilized {
    pub fn is_lyophilized(self) -> bool {
        matches!(self, Lyophilized::Lyophilized)
    }

    /// Combines a stored classification with a fresh observation. A drug
    /// that is already lyophilized stays lyophilized.
    pub fn promote(self, observed: Lyophilized) -> Lyophilized {
        if self.is_lyophilized() {
            Lyophilized::Lyophilized
        } else {
            observed
        }
    }
}

impl fmt::Display for Lyophilized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lyophilized::Lyophilized => write!(f, "true"),
            Lyophilized::NotLyophilized => write!(f, "false"),
            Lyophilized::Unknown => write!(f, "N/A"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum LyophilizedWire {
    Flag(bool),
    Text(String),
}

impl From<LyophilizedWire> for Lyophilized {
    fn from(value: LyophilizedWire) -> Self {
        match value {
            LyophilizedWire::Flag(true) => Lyophilized::Lyophilized,
            LyophilizedWire::Flag(false) => Lyophilized::NotLyophilized,
            LyophilizedWire::Text(_) => Lyophilized::Unknown,
        }
    }
}

impl From<Lyophilized> for LyophilizedWire {
    fn from(value: Lyophilized) -> Self {
        match value {
            Lyophilized::Lyophilized => LyophilizedWire::Flag(true),
            Lyophilized::NotLyophilized => LyophilizedWire::Flag(false),
            Lyophilized::Unknown => LyophilizedWire::Text("N/A".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRef {
    pub title: String,
    pub web_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IngredientEntry {
    pub name: String,
    pub code: String,
    pub strength: String,
}

impl IngredientEntry {
    pub fn dedup_key(&self) -> String {
        format!("{}{}{}", self.name, self.code, self.strength)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngredientClass {
    Active,
    Inactive,
}

impl IngredientClass {
    /// `ACT*` codes (ACTIB, ACTIM, ACTIR) are active, `IACT` is inactive.
    pub fn from_class_code(code: &str) -> Option<Self> {
        if code.starts_with("ACT") {
            Some(IngredientClass::Active)
        } else if code.starts_with("IACT") {
            Some(IngredientClass::Inactive)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelIngredientSet {
    pub active: Vec<IngredientEntry>,
    pub inactive: Vec<IngredientEntry>,
}

impl LabelIngredientSet {
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.inactive.is_empty()
    }
}

/// A drug document as stored in the `ingredients` and `lyophilized`
/// collections. Every field is optional so the same type doubles as a
/// `$set` patch: absent fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrugRecord {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ApplicationNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_number: Option<ApplicationNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub products: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<Vec<NaiveDate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lyophilized: Option<Lyophilized>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_ids: Option<BTreeMap<SetId, LabelRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_ingredients: Option<BTreeMap<SetId, Vec<IngredientEntry>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactive_ingredients: Option<BTreeMap<SetId, Vec<IngredientEntry>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_ingredients_list: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactive_ingredients_list: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lut: Option<i64>,
}

impl DrugRecord {
    pub fn keyed(id: ApplicationNumber) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn classification(&self) -> Lyophilized {
        self.lyophilized.unwrap_or_default()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.date.as_ref().and_then(|dates| dates.first().copied())
    }
}

/// Parses an openFDA `YYYYMMDD` submission date.
pub fn parse_submission_date(value: &str) -> Result<NaiveDate, LyoError> {
    let trimmed = value.trim();
    if trimmed.len() != 8 || !trimmed.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(LyoError::InvalidDate(value.to_string()));
    }
    let year = trimmed[0..4].parse::<i32>();
    let month = trimmed[4..6].parse::<u32>();
    let day = trimmed[6..8].parse::<u32>();
    match (year, month, day) {
        (Ok(year), Ok(month), Ok(day)) => NaiveDate::from_ymd_opt(year, month, day)
            .ok_or_else(|| LyoError::InvalidDate(value.to_string())),
        _ => Err(LyoError::InvalidDate(value.to_string())),
    }
}
