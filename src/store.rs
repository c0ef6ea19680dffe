use std::collections::VecDeque;
use std::fmt;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params, params_from_iter};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::LyoError;
use crate::retry::RetryPolicy;

pub type Document = Map<String, Value>;

const CURSOR_PAGE_SIZE: usize = 500;
const LAST_UPDATED_FIELD: &str = "lut";

/// The three logical collections of the LyoHub database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    /// Approval metadata from the openFDA bulk feed.
    DrugsMeta,
    /// Every drug, with its label map and classification.
    Ingredients,
    /// Lyophilized drugs only, with per-label ingredient lists.
    Lyophilized,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::DrugsMeta,
        Collection::Ingredients,
        Collection::Lyophilized,
    ];

    pub fn table(self) -> &'static str {
        match self {
            Collection::DrugsMeta => "drugs_meta",
            Collection::Ingredients => "ingredients",
            Collection::Lyophilized => "lyophilized",
        }
    }

    /// The field records of this collection are upserted by.
    pub fn key_field(self) -> &'static str {
        match self {
            Collection::DrugsMeta => "application_number",
            Collection::Ingredients | Collection::Lyophilized => "_id",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub matched: usize,
    pub inserted: usize,
    pub modified: usize,
    pub skipped: usize,
}

impl WriteSummary {
    pub fn absorb(&mut self, other: WriteSummary) {
        self.matched += other.matched;
        self.inserted += other.inserted;
        self.modified += other.modified;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Exists(String),
    Missing(String),
    /// Array field sharing at least one value with the list.
    ContainsAny(String, Vec<String>),
    /// Object field that has `key` among its keys.
    HasKey(String, String),
    /// Date (or array of dates) with any value in `[from, until)`.
    DateRange {
        field: String,
        from: Option<NaiveDate>,
        until: Option<NaiveDate>,
    },
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Eq(field, expected) => lookup(doc, field) == Some(expected),
            Filter::Exists(field) => lookup(doc, field).is_some_and(|value| !value.is_null()),
            Filter::Missing(field) => lookup(doc, field).is_none_or(Value::is_null),
            Filter::ContainsAny(field, wanted) => match lookup(doc, field) {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|item| wanted.iter().any(|w| w == item)),
                Some(Value::String(item)) => wanted.iter().any(|w| w == item),
                _ => false,
            },
            Filter::HasKey(field, key) => lookup(doc, field)
                .and_then(Value::as_object)
                .is_some_and(|map| map.contains_key(key)),
            Filter::DateRange { field, from, until } => {
                let in_range = |date: NaiveDate| {
                    from.is_none_or(|from| date >= from) && until.is_none_or(|until| date < until)
                };
                match lookup(doc, field) {
                    Some(Value::Array(items)) => items.iter().filter_map(as_date).any(in_range),
                    Some(value) => as_date(value).is_some_and(in_range),
                    None => false,
                }
            }
        }
    }
}

/// A conjunction of filters, optionally ordered by first submission date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub sort_by_date: bool,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn sorted_by_date(mut self) -> Self {
        self.sort_by_date = true;
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|filter| filter.matches(doc))
    }
}

/// Document store over an embedded SQLite database. One handle is opened
/// at process start and passed to every stage; [`Store::close`] flushes it.
pub struct Store {
    conn: Connection,
    path: Option<Utf8PathBuf>,
    retry: RetryPolicy,
}

impl Store {
    pub fn open(path: &Utf8Path) -> Result<Self, LyoError> {
        if let Some(parent) = path.parent() {
            if !parent.as_str().is_empty() {
                fs::create_dir_all(parent.as_std_path())
                    .map_err(|err| LyoError::Filesystem(format!("create {parent}: {err}")))?;
            }
        }
        let retry = RetryPolicy::store();
        let conn = retry.run(
            || Connection::open(path.as_std_path()).map_err(store_error),
            LyoError::is_store_connectivity,
        )?;
        let store = Self {
            conn,
            path: Some(path.to_path_buf()),
            retry,
        };
        store.init_schema()?;
        debug!(path = %path, "opened store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, LyoError> {
        let conn = Connection::open_in_memory().map_err(store_error)?;
        let store = Self {
            conn,
            path: None,
            retry: RetryPolicy::store(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    pub fn close(self) -> Result<(), LyoError> {
        self.conn.close().map_err(|(_, err)| store_error(err))
    }

    fn init_schema(&self) -> Result<(), LyoError> {
        let mut ddl = String::from("PRAGMA journal_mode = WAL;\nPRAGMA busy_timeout = 5000;\n");
        for collection in Collection::ALL {
            let table = collection.table();
            ddl.push_str(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    doc TEXT NOT NULL,
                    sort_date TEXT,
                    lut INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_sort_date ON {table}(sort_date, id);\n"
            ));
        }
        self.with_retry(|| self.conn.execute_batch(&ddl).map_err(store_error))
    }

    fn with_retry<T, F>(&self, operation: F) -> Result<T, LyoError>
    where
        F: FnMut() -> Result<T, LyoError>,
    {
        self.retry.run(operation, LyoError::is_store_connectivity)
    }

    /// Upserts typed records with `$set` semantics.
    pub fn upsert_many<T: Serialize>(
        &self,
        collection: Collection,
        records: &[T],
    ) -> Result<WriteSummary, LyoError> {
        let documents = records
            .iter()
            .map(to_document)
            .collect::<Result<Vec<_>, _>>()?;
        self.upsert_documents(collection, &documents)
    }

    /// Fields present in each document overwrite the stored ones; the rest
    /// of the stored document is kept. Every written document gets a fresh
    /// `lut` stamp. Documents without a key are skipped.
    pub fn upsert_documents(
        &self,
        collection: Collection,
        documents: &[Document],
    ) -> Result<WriteSummary, LyoError> {
        if documents.is_empty() {
            return Ok(WriteSummary::default());
        }
        let summary = self.with_retry(|| self.write_batch(collection, documents))?;
        debug!(
            %collection,
            matched = summary.matched,
            inserted = summary.inserted,
            modified = summary.modified,
            skipped = summary.skipped,
            "upsert batch written"
        );
        Ok(summary)
    }

    fn write_batch(
        &self,
        collection: Collection,
        documents: &[Document],
    ) -> Result<WriteSummary, LyoError> {
        let table = collection.table();
        let key_field = collection.key_field();
        let lut = chrono::Utc::now().timestamp();
        let mut summary = WriteSummary::default();

        let tx = self.conn.unchecked_transaction().map_err(store_error)?;
        {
            let mut select = tx
                .prepare_cached(&format!("SELECT doc FROM {table} WHERE id = ?1"))
                .map_err(store_error)?;
            let mut write = tx
                .prepare_cached(&format!(
                    "INSERT INTO {table} (id, doc, sort_date, lut) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                        doc = excluded.doc,
                        sort_date = excluded.sort_date,
                        lut = excluded.lut"
                ))
                .map_err(store_error)?;

            for document in documents {
                let Some(key) = document_key(document, key_field) else {
                    warn!(%collection, key_field, "record without key skipped");
                    summary.skipped += 1;
                    continue;
                };

                let existing: Option<String> = select
                    .query_row([&key], |row| row.get(0))
                    .optional()
                    .map_err(store_error)?;
                let mut merged = match &existing {
                    Some(raw) => parse_document(raw)?,
                    None => Document::new(),
                };
                let before = merged.clone();
                for (field, value) in document {
                    merged.insert(field.clone(), value.clone());
                }

                match existing {
                    Some(_) => {
                        summary.matched += 1;
                        if without_lut(&before) != without_lut(&merged) {
                            summary.modified += 1;
                        }
                    }
                    None => summary.inserted += 1,
                }

                merged.insert(LAST_UPDATED_FIELD.to_string(), Value::from(lut));
                let sort_date = first_date(&merged).map(|date| date.to_string());
                let raw = serde_json::to_string(&merged)
                    .map_err(|err| LyoError::Store(err.to_string()))?;
                write
                    .execute(params![key, raw, sort_date, lut])
                    .map_err(store_error)?;
            }
        }
        tx.commit().map_err(store_error)?;
        Ok(summary)
    }

    /// Deletes every record matching any of `filters`.
    pub fn delete_many(
        &self,
        collection: Collection,
        filters: &[Filter],
    ) -> Result<usize, LyoError> {
        if filters.is_empty() {
            return Ok(0);
        }
        let mut doomed = Vec::new();
        for document in self.find(collection, Query::all()) {
            let document = document?;
            if filters.iter().any(|filter| filter.matches(&document)) {
                if let Some(key) = document_key(&document, collection.key_field()) {
                    doomed.push(key);
                }
            }
        }
        let table = collection.table();
        self.with_retry(|| {
            let tx = self.conn.unchecked_transaction().map_err(store_error)?;
            {
                let mut delete = tx
                    .prepare_cached(&format!("DELETE FROM {table} WHERE id = ?1"))
                    .map_err(store_error)?;
                for key in &doomed {
                    delete.execute([key]).map_err(store_error)?;
                }
            }
            tx.commit().map_err(store_error)
        })?;
        debug!(%collection, deleted = doomed.len(), "records deleted");
        Ok(doomed.len())
    }

    pub fn get(&self, collection: Collection, key: &str) -> Result<Option<Document>, LyoError> {
        let table = collection.table();
        let raw: Option<String> = self.with_retry(|| {
            self.conn
                .query_row(&format!("SELECT doc FROM {table} WHERE id = ?1"), [key], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(store_error)
        })?;
        raw.as_deref().map(parse_document).transpose()
    }

    pub fn get_as<T: DeserializeOwned>(
        &self,
        collection: Collection,
        key: &str,
    ) -> Result<Option<T>, LyoError> {
        self.get(collection, key)?
            .map(from_document)
            .transpose()
    }

    /// Lazily streams matching documents, one page at a time.
    pub fn find(&self, collection: Collection, query: Query) -> Cursor<'_> {
        Cursor {
            store: self,
            collection,
            query,
            last: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn find_as<T: DeserializeOwned>(
        &self,
        collection: Collection,
        query: Query,
    ) -> impl Iterator<Item = Result<T, LyoError>> + '_ {
        self.find(collection, query)
            .map(|document| document.and_then(from_document))
    }

    pub fn count(&self, collection: Collection, query: Query) -> Result<usize, LyoError> {
        let mut count = 0usize;
        for document in self.find(collection, query) {
            document?;
            count += 1;
        }
        Ok(count)
    }

    /// One page of rows after `after`, in cursor order. `Eq` filters on
    /// scalars are evaluated in SQL; every filter is re-checked on the
    /// decoded document by the cursor.
    fn fetch_page(
        &self,
        collection: Collection,
        query: &Query,
        after: Option<&PageKey>,
    ) -> Result<Vec<(PageKey, Document)>, LyoError> {
        let table = collection.table();
        let mut conditions = Vec::new();
        let mut values = Vec::new();
        for filter in &query.filters {
            if let Filter::Eq(field, expected) = filter {
                if let Some(value) = sql_scalar(expected) {
                    conditions.push("json_extract(doc, ?) = ?".to_string());
                    values.push(SqlValue::Text(format!("$.{field}")));
                    values.push(value);
                }
            }
        }

        let order = if query.sort_by_date {
            "sort_date IS NULL, COALESCE(sort_date, ''), id"
        } else {
            "id"
        };
        if let Some(after) = after {
            if query.sort_by_date {
                conditions
                    .push("(sort_date IS NULL, COALESCE(sort_date, ''), id) > (?, ?, ?)".to_string());
                values.push(SqlValue::Integer(i64::from(after.sort_date.is_none())));
                values.push(SqlValue::Text(after.sort_date.clone().unwrap_or_default()));
            } else {
                conditions.push("id > ?".to_string());
            }
            values.push(SqlValue::Text(after.id.clone()));
        }
        values.push(SqlValue::Integer(CURSOR_PAGE_SIZE as i64));

        let predicate = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let sql = format!("SELECT id, sort_date, doc FROM {table} {predicate} ORDER BY {order} LIMIT ?");
        let rows: Vec<(String, Option<String>, String)> = self.with_retry(|| {
            let mut stmt = self.conn.prepare_cached(&sql).map_err(store_error)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .map_err(store_error)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(store_error)
        })?;
        rows.into_iter()
            .map(|(id, sort_date, raw)| Ok((PageKey { id, sort_date }, parse_document(&raw)?)))
            .collect()
    }
}

/// Position of the last row a cursor has read.
#[derive(Debug, Clone)]
struct PageKey {
    id: String,
    sort_date: Option<String>,
}

/// Paged iterator over a collection. Pages are read by key rather than
/// offset, so rewriting rows already visited never skips rows still ahead.
/// Errors are yielded once, after which the cursor is exhausted.
pub struct Cursor<'a> {
    store: &'a Store,
    collection: Collection,
    query: Query,
    last: Option<PageKey>,
    buffer: VecDeque<Document>,
    exhausted: bool,
}

impl Iterator for Cursor<'_> {
    type Item = Result<Document, LyoError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(document) = self.buffer.pop_front() {
                return Some(Ok(document));
            }
            if self.exhausted {
                return None;
            }
            let page = match self
                .store
                .fetch_page(self.collection, &self.query, self.last.as_ref())
            {
                Ok(page) => page,
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            };
            if page.len() < CURSOR_PAGE_SIZE {
                self.exhausted = true;
            }
            if let Some((key, _)) = page.last() {
                self.last = Some(key.clone());
            }
            self.buffer = page
                .into_iter()
                .map(|(_, document)| document)
                .filter(|document| self.query.matches(document))
                .collect();
        }
    }
}

pub fn to_document<T: Serialize>(value: &T) -> Result<Document, LyoError> {
    match serde_json::to_value(value).map_err(|err| LyoError::Store(err.to_string()))? {
        Value::Object(map) => Ok(map),
        other => Err(LyoError::Store(format!(
            "record must serialize to an object, got {other}"
        ))),
    }
}

pub fn from_document<T: DeserializeOwned>(document: Document) -> Result<T, LyoError> {
    serde_json::from_value(Value::Object(document))
        .map_err(|err| LyoError::parse("stored record", err))
}

fn parse_document(raw: &str) -> Result<Document, LyoError> {
    serde_json::from_str(raw).map_err(|err| LyoError::parse("stored record", err))
}

fn lookup<'a>(doc: &'a Document, field: &str) -> Option<&'a Value> {
    let mut parts = field.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn document_key(document: &Document, key_field: &str) -> Option<String> {
    match document.get(key_field)? {
        Value::String(key) if !key.is_empty() => Some(key.clone()),
        Value::Number(key) => Some(key.to_string()),
        _ => None,
    }
}

/// SQL form of a JSON scalar as `json_extract` returns it. Booleans come
/// back as integers, so the decoded document is still checked afterwards.
fn sql_scalar(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Bool(flag) => Some(SqlValue::Integer(i64::from(*flag))),
        Value::String(text) => Some(SqlValue::Text(text.clone())),
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real)),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn as_date(value: &Value) -> Option<NaiveDate> {
    value.as_str()?.parse::<NaiveDate>().ok()
}

fn first_date(document: &Document) -> Option<NaiveDate> {
    match document.get("date")? {
        Value::Array(items) => items.iter().filter_map(as_date).min(),
        value => as_date(value),
    }
}

fn without_lut(document: &Document) -> Document {
    let mut copy = document.clone();
    copy.remove(LAST_UPDATED_FIELD);
    copy
}

fn store_error(err: rusqlite::Error) -> LyoError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen) => {
            LyoError::StoreConnectivity(err.to_string())
        }
        _ => LyoError::Store(err.to_string()),
    }
}
