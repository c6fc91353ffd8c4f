//! Shared data model: scalar values, records, and table descriptions.
//!
//! These types flow through every layer (pool, loader, orchestrator, read
//! side) and carry no behaviour beyond validation.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{SpecError, ValidationError};

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A typed scalar stored in a warehouse cell.
///
/// Deserialises from plain JSON scalars: `null`, integers, floats, strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// This value stored in a column of `kind`, or `None` if it does not fit.
    pub fn coerce(&self, kind: ColumnKind) -> Option<Self> {
        match (kind, self) {
            (_, Self::Null) => Some(Self::Null),
            (ColumnKind::Text, Self::Text(s)) => Some(Self::Text(s.clone())),
            (ColumnKind::Text, other) => Some(Self::Text(other.to_string())),
            (ColumnKind::Integer, Self::Int(i)) => Some(Self::Int(*i)),
            (ColumnKind::Integer, Self::Float(f)) => float_to_int(*f).map(Self::Int),
            (ColumnKind::Integer, Self::Text(s)) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(float_to_int))
                    .map(Self::Int)
            }
            (ColumnKind::Double, Self::Int(i)) => Some(Self::Float(*i as f64)),
            (ColumnKind::Double, Self::Float(f)) => Some(Self::Float(canonical_zero(*f))),
            (ColumnKind::Double, Self::Text(s)) => {
                s.trim().parse::<f64>().ok().map(|f| Self::Float(canonical_zero(f)))
            }
        }
    }
}

fn float_to_int(f: f64) -> Option<i64> {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0; // 2^63
    (f.is_finite() && f.fract() == 0.0 && (-LIMIT..LIMIT).contains(&f)).then_some(f as i64)
}

// -0.0 and 0.0 are one key.
fn canonical_zero(f: f64) -> f64 {
    if f == 0.0 {
        0.0
    } else {
        f
    }
}

// Floats compare by bit pattern so `Value` can key a hash map.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Text(a), Self::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Int(i) => i.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::Text(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One row: a mapping from column name to value.
///
/// A record is loosely shaped until it is checked against a [`TableSpec`]
/// with [`TableSpec::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy for fixtures.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    /// Value for `column`, with absent columns read as `Null`.
    pub fn value_or_null(&self, column: &str) -> Value {
        self.fields.get(column).cloned().unwrap_or(Value::Null)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Columns and TableSpec
// ---------------------------------------------------------------------------

/// Storage type of a warehouse column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Integer,
    Double,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnKind,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Integer)
    }

    pub fn double(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Double)
    }
}

/// Description of a target table: name, ordered columns, and the natural key
/// that the uniqueness constraint (and every merge) is built on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    name: String,
    columns: Vec<Column>,
    key: Vec<String>,
}

impl TableSpec {
    /// Build a spec, rejecting shapes no uniqueness constraint could cover.
    ///
    /// # Errors
    /// - [`SpecError::EmptyName`] for a blank table name.
    /// - [`SpecError::DuplicateColumn`] if a column name repeats.
    /// - [`SpecError::EmptyKey`] if no key columns are given.
    /// - [`SpecError::UnknownKeyColumn`] if a key column is not a column.
    pub fn new(
        name: impl Into<String>,
        columns: Vec<Column>,
        key: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, SpecError> {
        let name = name.into();
        let key: Vec<String> = key.into_iter().map(Into::into).collect();
        if name.trim().is_empty() {
            return Err(SpecError::EmptyName);
        }

        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(SpecError::DuplicateColumn(column.name.clone()));
            }
        }

        if key.is_empty() {
            return Err(SpecError::EmptyKey(name));
        }
        let mut seen_key = HashSet::new();
        for k in &key {
            if !seen.contains(k.as_str()) {
                return Err(SpecError::UnknownKeyColumn {
                    table: name,
                    column: k.clone(),
                });
            }
            if !seen_key.insert(k.as_str()) {
                return Err(SpecError::DuplicateColumn(k.clone()));
            }
        }

        Ok(Self { name, columns, key })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn key(&self) -> &[String] {
        &self.key
    }

    pub fn is_key_column(&self, column: &str) -> bool {
        self.key.iter().any(|k| k == column)
    }

    /// Columns updated when a merge matches an existing row.
    pub fn non_key_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !self.is_key_column(&c.name))
    }

    /// Check that every key column carries a non-null value.
    pub fn validate(&self, record: &Record) -> Result<(), ValidationError> {
        for column in &self.key {
            match record.get(column) {
                Some(v) if !v.is_null() => {}
                _ => {
                    return Err(ValidationError::MissingKey {
                        table: self.name.clone(),
                        column: column.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Coerce every value of `record` to its column's kind, then validate.
    ///
    /// Integral floats and numeric text become `Int` in integer columns,
    /// numbers become `Float` in double columns and text in text columns.
    /// A non-key value that cannot be coerced is kept as is for the backend
    /// to reject; a key value that cannot be coerced fails the record.
    pub fn normalize(&self, mut record: Record) -> Result<Record, ValidationError> {
        for column in &self.columns {
            let Some(value) = record.fields.get_mut(&column.name) else {
                continue;
            };
            match value.coerce(column.kind) {
                Some(coerced) => *value = coerced,
                None if self.is_key_column(&column.name) => {
                    return Err(ValidationError::KeyType {
                        table: self.name.clone(),
                        column: column.name.clone(),
                        value: value.to_string(),
                    })
                }
                None => {}
            }
        }
        self.validate(&record)?;
        Ok(record)
    }

    /// Key values of `record` in key-column order, or `None` if incomplete.
    ///
    /// Keys compare by variant, so callers pass records that went through
    /// [`TableSpec::normalize`].
    pub fn key_of(&self, record: &Record) -> Option<Vec<Value>> {
        self.key
            .iter()
            .map(|k| record.get(k).filter(|v| !v.is_null()).cloned())
            .collect()
    }

    /// Values of `record` in column order, absent columns as `Null`.
    pub fn row_values(&self, record: &Record) -> Vec<Value> {
        self.columns
            .iter()
            .map(|c| record.value_or_null(&c.name))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Existing table shape
// ---------------------------------------------------------------------------

/// What a backend reports about a table that already exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableShape {
    pub columns: Vec<String>,
    /// Column sets covered by a unique or primary-key constraint.
    pub unique_keys: Vec<Vec<String>>,
}

impl TableShape {
    /// Spec columns the existing table does not have.
    pub fn missing_columns(&self, spec: &TableSpec) -> Vec<String> {
        spec.column_names()
            .filter(|c| !self.columns.iter().any(|e| e.eq_ignore_ascii_case(c)))
            .map(str::to_owned)
            .collect()
    }

    /// True if one of the table's unique constraints covers exactly the
    /// spec's key columns (order-insensitive).
    pub fn has_unique_key(&self, spec: &TableSpec) -> bool {
        let wanted: HashSet<String> = spec.key().iter().map(|k| k.to_lowercase()).collect();
        self.unique_keys.iter().any(|uk| {
            let have: HashSet<String> = uk.iter().map(|k| k.to_lowercase()).collect();
            have == wanted
        })
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// A parameterized `SELECT`: equality filters and an ordering, nothing more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub table: String,
    pub filters: Vec<(String, Value)>,
    pub order_by: Vec<String>,
}

impl Selection {
    pub fn from_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            order_by: Vec::new(),
        }
    }

    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by.push(column.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn financials() -> TableSpec {
        TableSpec::new(
            "company_financials",
            vec![
                Column::text("company"),
                Column::integer("year"),
                Column::double("revenue_usd"),
            ],
            ["company", "year"],
        )
        .expect("valid spec")
    }

    #[test]
    fn key_column_must_be_a_column() {
        let err = TableSpec::new("t", vec![Column::text("a")], ["b"]).unwrap_err();
        assert!(matches!(err, SpecError::UnknownKeyColumn { column, .. } if column == "b"));
    }

    #[test]
    fn empty_key_is_rejected() {
        let err = TableSpec::new("t", vec![Column::text("a")], Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, SpecError::EmptyKey(_)));
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let err =
            TableSpec::new("t", vec![Column::text("a"), Column::integer("a")], ["a"]).unwrap_err();
        assert!(matches!(err, SpecError::DuplicateColumn(c) if c == "a"));
    }

    #[test]
    fn null_key_value_fails_validation() {
        let spec = financials();
        let record = Record::new()
            .with("company", "Apple")
            .with("year", Value::Null);
        assert!(matches!(
            spec.validate(&record),
            Err(ValidationError::MissingKey { column, .. }) if column == "year"
        ));
    }

    #[test]
    fn missing_non_key_columns_are_fine() {
        let spec = financials();
        let record = Record::new().with("company", "Apple").with("year", 2023);
        assert!(spec.validate(&record).is_ok());
        assert_eq!(
            spec.row_values(&record),
            vec![Value::from("Apple"), Value::Int(2023), Value::Null]
        );
    }

    #[test]
    fn records_deserialize_from_json_scalars() {
        let record: Record =
            serde_json::from_str(r#"{"company":"Apple","year":2023,"revenue_usd":1.5,"note":null}"#)
                .expect("valid json");
        assert_eq!(record.get("year"), Some(&Value::Int(2023)));
        assert_eq!(record.get("revenue_usd"), Some(&Value::Float(1.5)));
        assert_eq!(record.get("note"), Some(&Value::Null));
    }

    #[test]
    fn normalize_coerces_values_to_column_kinds() {
        let spec = financials();
        let record = Record::new()
            .with("company", 42)
            .with("year", 2023.0)
            .with("revenue_usd", 100);
        let record = spec.normalize(record).unwrap();

        assert_eq!(record.get("company"), Some(&Value::from("42")));
        assert_eq!(record.get("year"), Some(&Value::Int(2023)));
        assert_eq!(record.get("revenue_usd"), Some(&Value::Float(100.0)));

        let from_text = spec
            .normalize(Record::new().with("company", "Apple").with("year", " 2023 "))
            .unwrap();
        assert_eq!(from_text.get("year"), Some(&Value::Int(2023)));
    }

    #[test]
    fn normalize_rejects_key_that_cannot_be_coerced() {
        let spec = financials();
        for year in [Value::Float(2023.5), Value::from("next year"), Value::Float(f64::NAN)] {
            let record = Record::new().with("company", "Apple").with("year", year);
            assert!(matches!(
                spec.normalize(record),
                Err(ValidationError::KeyType { column, .. }) if column == "year"
            ));
        }
    }

    #[test]
    fn normalize_keeps_uncoercible_non_key_values() {
        let spec = financials();
        let record = Record::new()
            .with("company", "Apple")
            .with("year", 2023)
            .with("revenue_usd", "n/a");
        let record = spec.normalize(record).unwrap();
        assert_eq!(record.get("revenue_usd"), Some(&Value::from("n/a")));
    }

    #[test]
    fn normalize_still_requires_key_values() {
        let spec = financials();
        let record = Record::new().with("company", "Apple").with("year", Value::Null);
        assert!(matches!(
            spec.normalize(record),
            Err(ValidationError::MissingKey { .. })
        ));
    }

    #[test]
    fn shape_matches_key_regardless_of_order_and_case() {
        let shape = TableShape {
            columns: vec!["COMPANY".into(), "YEAR".into(), "REVENUE_USD".into()],
            unique_keys: vec![vec!["YEAR".into(), "COMPANY".into()]],
        };
        let spec = financials();
        assert!(shape.has_unique_key(&spec));
        assert!(shape.missing_columns(&spec).is_empty());
    }
}
