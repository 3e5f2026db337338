//! Core record, property and filter types shared across the PMS crates.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pms-core";

/// Primitive value carried by a source record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
}

impl RecordValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Null | Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
        }
    }
}

impl fmt::Display for RecordValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for RecordValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for RecordValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for RecordValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for RecordValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for RecordValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<RecordValue>> From<Option<T>> for RecordValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Normalized adapter output: field name to primitive value, ordered by key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, RecordValue>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<RecordValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<RecordValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&RecordValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RecordValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Destination property kinds understood by the write and filter paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    Date,
    Number,
    RichText,
    Select,
    Title,
    Relation,
}

impl PropertyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Date => "date",
            Self::Number => "number",
            Self::RichText => "rich_text",
            Self::Select => "select",
            Self::Title => "title",
            Self::Relation => "relation",
        }
    }
}

/// Destination-native typed property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Date { start: String },
    Number(Option<f64>),
    RichText(String),
    Select(String),
    Title(String),
    Relation(Vec<String>),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            Self::Date { .. } => PropertyKind::Date,
            Self::Number(_) => PropertyKind::Number,
            Self::RichText(_) => PropertyKind::RichText,
            Self::Select(_) => PropertyKind::Select,
            Self::Title(_) => PropertyKind::Title,
            Self::Relation(_) => PropertyKind::Relation,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(v) => *v,
            _ => None,
        }
    }

    /// Plain text of text-like properties (rich text, title, select).
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::RichText(v) | Self::Title(v) | Self::Select(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn date_start(&self) -> Option<&str> {
        match self {
            Self::Date { start } => Some(start.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertySet(BTreeMap<String, PropertyValue>);

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: impl Into<String>, value: PropertyValue) -> Option<PropertyValue> {
        self.0.insert(label.into(), value)
    }

    pub fn get(&self, label: &str) -> Option<&PropertyValue> {
        self.0.get(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrite every property present in `other`, keeping the rest.
    pub fn merge(&mut self, other: PropertySet) {
        self.0.extend(other.0);
    }
}

impl FromIterator<(String, PropertyValue)> for PropertySet {
    fn from_iter<I: IntoIterator<Item = (String, PropertyValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Point-in-time view of a row owned by the destination store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationRow {
    pub id: String,
    pub properties: PropertySet,
}

impl DestinationRow {
    pub fn number(&self, label: &str) -> Option<f64> {
        self.properties.get(label).and_then(PropertyValue::as_number)
    }

    pub fn text(&self, label: &str) -> Option<&str> {
        self.properties.get(label).and_then(PropertyValue::as_text)
    }

    pub fn date_start(&self, label: &str) -> Option<&str> {
        self.properties.get(label).and_then(PropertyValue::date_start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    OnOrAfter,
    Before,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

/// One `{property, operator, value}` triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub property: String,
    pub kind: PropertyKind,
    pub operator: FilterOperator,
    pub value: FilterValue,
}

impl Condition {
    pub fn on_or_after(property: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            property: property.into(),
            kind: PropertyKind::Date,
            operator: FilterOperator::OnOrAfter,
            value: FilterValue::Date(date),
        }
    }

    pub fn before(property: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            property: property.into(),
            kind: PropertyKind::Date,
            operator: FilterOperator::Before,
            value: FilterValue::Date(date),
        }
    }

    pub fn equals_number(property: impl Into<String>, value: f64) -> Self {
        Self {
            property: property.into(),
            kind: PropertyKind::Number,
            operator: FilterOperator::Equals,
            value: FilterValue::Number(value),
        }
    }

    pub fn equals_text(property: impl Into<String>, kind: PropertyKind, value: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            kind,
            operator: FilterOperator::Equals,
            value: FilterValue::Text(value.into()),
        }
    }

    /// Local evaluation, mirroring what the remote store does with the same triple.
    pub fn matches(&self, properties: &PropertySet) -> bool {
        let Some(prop) = properties.get(&self.property) else {
            return false;
        };
        match (&self.operator, &self.value) {
            (FilterOperator::Equals, FilterValue::Number(n)) => prop.as_number() == Some(*n),
            (FilterOperator::Equals, FilterValue::Text(t)) => prop.as_text() == Some(t.as_str()),
            (FilterOperator::Equals, FilterValue::Date(d)) => stored_day(prop) == Some(*d),
            (FilterOperator::OnOrAfter, FilterValue::Date(d)) => {
                stored_day(prop).is_some_and(|day| day >= *d)
            }
            (FilterOperator::Before, FilterValue::Date(d)) => {
                stored_day(prop).is_some_and(|day| day < *d)
            }
            _ => false,
        }
    }
}

fn stored_day(prop: &PropertyValue) -> Option<NaiveDate> {
    prop.date_start().and_then(|s| parse_day(s).ok())
}

/// AND-combination of conditions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn and(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    pub fn single(condition: Condition) -> Self {
        Self {
            conditions: vec![condition],
        }
    }

    /// `property >= start AND property < end_exclusive`.
    pub fn date_range(property: &str, range: &DateRange) -> Self {
        Self::and(vec![
            Condition::on_or_after(property, range.start()),
            Condition::before(property, range.end_exclusive()),
        ])
    }

    pub fn matches(&self, properties: &PropertySet) -> bool {
        self.conditions.iter().all(|c| c.matches(properties))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidDateError {
    #[error("invalid date `{input}`: expected YYYY-MM-DD or an ISO-8601 timestamp")]
    Unparseable { input: String },
    #[error("empty date range: {start} is not before {end_exclusive}")]
    EmptyRange {
        start: NaiveDate,
        end_exclusive: NaiveDate,
    },
}

/// Parse a calendar day from a date or date-time string, keeping the date as written.
pub fn parse_day(input: &str) -> Result<NaiveDate, InvalidDateError> {
    let trimmed = input.trim();
    if let Ok(day) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(day);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.date_naive());
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(ts.date());
    }
    Err(InvalidDateError::Unparseable {
        input: input.to_string(),
    })
}

pub fn is_iso8601(input: &str) -> bool {
    parse_day(input).is_ok()
}

/// Half-open day window `[start, end_exclusive)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDate,
    end_exclusive: NaiveDate,
}

impl DateRange {
    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end_exclusive: day + Duration::days(1),
        }
    }

    pub fn between(start: NaiveDate, end_exclusive: NaiveDate) -> Result<Self, InvalidDateError> {
        if start >= end_exclusive {
            return Err(InvalidDateError::EmptyRange {
                start,
                end_exclusive,
            });
        }
        Ok(Self {
            start,
            end_exclusive,
        })
    }

    /// `[day - 1, day + 1)`, for events whose date may be logged one day early.
    pub fn two_day_period(day: NaiveDate) -> Self {
        Self {
            start: day - Duration::days(1),
            end_exclusive: day + Duration::days(1),
        }
    }

    /// Same end, start pulled back one day.
    pub fn with_previous_day(&self) -> Self {
        Self {
            start: self.start - Duration::days(1),
            end_exclusive: self.end_exclusive,
        }
    }

    pub fn parse_single(input: &str) -> Result<Self, InvalidDateError> {
        parse_day(input).map(Self::single_day)
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end_exclusive(&self) -> NaiveDate {
        self.end_exclusive
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.start && day < self.end_exclusive
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end_exclusive)
    }
}
