//! Field mapping, reconciliation and batch orchestration for PMS.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use pms_adapters::{
    adapter_for_integration, AdapterContext, AdapterCredentials, AdapterError, IntegrationAdapter,
    LingqConfig, WhoopConfig, DEFAULT_LINGQ_API_URL, DEFAULT_WHOOP_API_URL,
};
use pms_core::{
    parse_day, Condition, DateRange, DestinationRow, Filter, InvalidDateError, PropertyKind,
    PropertySet, PropertyValue, Record, RecordValue,
};
use pms_storage::{
    DestinationStore, HttpClient, HttpClientConfig, NotionConfig, NotionStore, StoreError,
    DEFAULT_NOTION_API_URL,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pms-sync";

pub const DEFAULT_COMPARISON_FIELD: &str = "Custom ID";
pub const DEFAULT_DATE_PROPERTY: &str = "Date";
pub const DEFAULT_COMPARE_KEY: &str = "id";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {origin}: {source}")]
    Parse {
        origin: String,
        source: serde_yaml::Error,
    },
    #[error("integration {integration}: {source}")]
    Mapping {
        integration: String,
        source: FieldMappingError,
    },
    #[error("integration {integration}: label `{label}` is mapped more than once")]
    DuplicateLabel { integration: String, label: String },
    #[error("integration {integration}: comparison field `{field}` must be mapped as a number")]
    NonNumericComparison { integration: String, field: String },
    #[error("no configuration found for integration {0}")]
    UnknownIntegration(String),
    #[error("no adapter available for integration {0}")]
    NoAdapter(String),
    #[error("missing credential {variable} for integration {integration}")]
    MissingCredential {
        integration: String,
        variable: &'static str,
    },
    #[error("building http client: {0}")]
    HttpClient(String),
}

#[derive(Debug, Error)]
pub enum FieldMappingError {
    #[error("field `{field}` expects key `{key}` which is missing from the record")]
    MissingKey { field: String, key: String },
    #[error("field `{field}` has unsupported type `{type_name}`")]
    UnsupportedType { field: String, type_name: String },
    #[error("field `{field}` is a relation but declares no relation target")]
    MissingRelation { field: String },
    #[error("field `{field}` expects {expected} for key `{key}`, found {found}")]
    InvalidValue {
        field: String,
        key: String,
        expected: &'static str,
        found: String,
    },
    #[error("field `{field}` relation lookup failed: {source}")]
    RelationLookup { field: String, source: StoreError },
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    InvalidDate(#[from] InvalidDateError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Mapping(FieldMappingError),
    #[error("querying rows: {0}")]
    Query(#[from] QueryError),
    #[error("comparison field `{field}` must be numeric, found {found}")]
    ComparisonValue { field: String, found: String },
    #[error("integration {0} has no date mapping to derive a lookup window from")]
    MissingDate(String),
    #[error("writing row: {0}")]
    Store(#[from] StoreError),
}

impl From<FieldMappingError> for UpsertError {
    fn from(err: FieldMappingError) -> Self {
        match err {
            FieldMappingError::RelationLookup { field, source } => {
                warn!(%field, error = %source, "relation lookup failed");
                Self::Query(QueryError::Store(source))
            }
            other => Self::Mapping(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("fetching {integration}: {source}")]
    Fetch {
        integration: String,
        source: AdapterError,
    },
}

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub notion_token: String,
    pub notion_api_url: String,
    pub config_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub credentials: AdapterCredentials,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let notion_token = var("NOTION_TOKEN").ok_or(ConfigError::MissingEnv("NOTION_TOKEN"))?;

        let lingq = var("LINGQ_API_KEY").map(|api_key| LingqConfig {
            api_url: var("LINGQ_API_URL").unwrap_or_else(|| DEFAULT_LINGQ_API_URL.to_string()),
            api_key,
        });
        let whoop = var("WHOOP_ACCESS_TOKEN").map(|access_token| WhoopConfig {
            api_url: var("WHOOP_API_URL").unwrap_or_else(|| DEFAULT_WHOOP_API_URL.to_string()),
            access_token,
        });

        Ok(Self {
            notion_token,
            notion_api_url: var("NOTION_API_URL").unwrap_or_else(|| DEFAULT_NOTION_API_URL.to_string()),
            config_path: var("PMS_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./notion.config.yml")),
            user_agent: var("PMS_USER_AGENT").unwrap_or_else(|| "pms-sync/0.1".to_string()),
            http_timeout_secs: var("PMS_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            credentials: AdapterCredentials { lingq, whoop },
        })
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn notion_store(&self) -> anyhow::Result<NotionStore> {
        let mut config = NotionConfig::new(self.notion_token.clone());
        config.api_url = self.notion_api_url.clone();
        config.http.timeout = Duration::from_secs(self.http_timeout_secs);
        config.http.user_agent = Some(self.user_agent.clone());
        NotionStore::new(config).context("building notion store")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Upsert,
    CreateOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonStrategy {
    #[default]
    Id,
    ContentHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupKind {
    #[default]
    Title,
    RichText,
    Number,
}

impl LookupKind {
    fn property_kind(self) -> PropertyKind {
        match self {
            Self::Title => PropertyKind::Title,
            Self::RichText => PropertyKind::RichText,
            Self::Number => PropertyKind::Number,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationTarget {
    #[serde(alias = "database_id")]
    pub table_id: String,
    pub field_name: String,
    #[serde(default)]
    pub field_type: LookupKind,
}

/// What a mapping emits; each variant carries only what it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Date,
    Number,
    Text,
    Select,
    Title,
    Relation(RelationTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub name: String,
    pub key: String,
    pub label: String,
    pub kind: FieldKind,
}

impl FieldMapping {
    pub fn new(key: impl Into<String>, label: impl Into<String>, kind: FieldKind) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            key,
            label: label.into(),
            kind,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFieldMapping {
    #[serde(rename = "type")]
    type_name: String,
    label: String,
    key: String,
    #[serde(default)]
    relation: Option<RelationTarget>,
}

impl RawFieldMapping {
    fn into_mapping(self, name: String) -> Result<FieldMapping, FieldMappingError> {
        let kind = match self.type_name.as_str() {
            "date" => FieldKind::Date,
            "number" => FieldKind::Number,
            "text" | "rich_text" => FieldKind::Text,
            "select" => FieldKind::Select,
            "title" => FieldKind::Title,
            "relation" => FieldKind::Relation(
                self.relation
                    .ok_or_else(|| FieldMappingError::MissingRelation { field: name.clone() })?,
            ),
            other => {
                return Err(FieldMappingError::UnsupportedType {
                    field: name,
                    type_name: other.to_string(),
                })
            }
        };
        Ok(FieldMapping {
            name,
            key: self.key,
            label: self.label,
            kind,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawIntegration {
    #[serde(alias = "database_id")]
    table_id: String,
    #[serde(default)]
    comparison_field: Option<String>,
    #[serde(default)]
    date_property: Option<String>,
    #[serde(default)]
    mode: SyncMode,
    #[serde(default)]
    compare_key: Option<String>,
    #[serde(default)]
    comparison_strategy: ComparisonStrategy,
    #[serde(default)]
    two_day_period: bool,
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default)]
    field_mappings: serde_yaml::Mapping,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationConfig {
    pub name: String,
    pub table_id: String,
    pub comparison_field: String,
    pub date_property: String,
    pub mode: SyncMode,
    pub compare_key: String,
    pub comparison_strategy: ComparisonStrategy,
    pub two_day_period: bool,
    pub schedule: Option<String>,
    pub field_mappings: Vec<FieldMapping>,
}

impl IntegrationConfig {
    pub fn new(name: impl Into<String>, table_id: impl Into<String>, field_mappings: Vec<FieldMapping>) -> Self {
        Self {
            name: name.into(),
            table_id: table_id.into(),
            comparison_field: DEFAULT_COMPARISON_FIELD.to_string(),
            date_property: DEFAULT_DATE_PROPERTY.to_string(),
            mode: SyncMode::Upsert,
            compare_key: DEFAULT_COMPARE_KEY.to_string(),
            comparison_strategy: ComparisonStrategy::Id,
            two_day_period: false,
            schedule: None,
            field_mappings,
        }
    }

    /// Destination property holding the comparison value for `compare_field`.
    pub fn comparison_label(&self, compare_field: &str) -> &str {
        self.field_mappings
            .iter()
            .find(|m| m.key == compare_field)
            .map(|m| m.label.as_str())
            .unwrap_or(&self.comparison_field)
    }

    /// Record key feeding the date property used by the lookup window.
    pub fn date_key(&self) -> Option<&str> {
        let dates = || self.field_mappings.iter().filter(|m| m.kind == FieldKind::Date);
        dates()
            .find(|m| m.label == self.date_property)
            .or_else(|| dates().next())
            .map(|m| m.key.as_str())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut labels = BTreeSet::new();
        // the hash strategy writes its own property next to the mapped ones
        if self.comparison_strategy == ComparisonStrategy::ContentHash {
            labels.insert(self.comparison_field.as_str());
        }
        for mapping in &self.field_mappings {
            if !labels.insert(mapping.label.as_str()) {
                return Err(ConfigError::DuplicateLabel {
                    integration: self.name.clone(),
                    label: mapping.label.clone(),
                });
            }
        }

        if self.mode == SyncMode::Upsert && self.comparison_strategy == ComparisonStrategy::Id {
            let compared = self.field_mappings.iter().find(|m| m.key == self.compare_key);
            if let Some(mapping) = compared.filter(|m| m.kind != FieldKind::Number) {
                return Err(ConfigError::NonNumericComparison {
                    integration: self.name.clone(),
                    field: mapping.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Immutable integration table, loaded once per process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntegrationsConfig {
    integrations: BTreeMap<String, IntegrationConfig>,
}

impl IntegrationsConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, &path.display().to_string())
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Self::parse(text, "<inline>")
    }

    fn parse(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let raw: BTreeMap<String, RawIntegration> =
            serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
                origin: origin.to_string(),
                source,
            })?;

        let mut integrations = BTreeMap::new();
        for (name, raw) in raw {
            let mut field_mappings = Vec::with_capacity(raw.field_mappings.len());
            for (field, value) in raw.field_mappings {
                let field = field
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{field:?}"));
                let raw_mapping: RawFieldMapping =
                    serde_yaml::from_value(value).map_err(|source| ConfigError::Parse {
                        origin: format!("{origin} ({name}.field_mappings.{field})"),
                        source,
                    })?;
                let mapping = raw_mapping
                    .into_mapping(field)
                    .map_err(|source| ConfigError::Mapping {
                        integration: name.clone(),
                        source,
                    })?;
                field_mappings.push(mapping);
            }

            let config = IntegrationConfig {
                name: name.clone(),
                table_id: raw.table_id,
                comparison_field: raw
                    .comparison_field
                    .unwrap_or_else(|| DEFAULT_COMPARISON_FIELD.to_string()),
                date_property: raw
                    .date_property
                    .unwrap_or_else(|| DEFAULT_DATE_PROPERTY.to_string()),
                mode: raw.mode,
                compare_key: raw
                    .compare_key
                    .unwrap_or_else(|| DEFAULT_COMPARE_KEY.to_string()),
                comparison_strategy: raw.comparison_strategy,
                two_day_period: raw.two_day_period,
                schedule: raw.schedule,
                field_mappings,
            };
            config.validate()?;
            integrations.insert(name, config);
        }
        Ok(Self { integrations })
    }

    pub fn with_integration(mut self, config: IntegrationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        self.integrations.insert(config.name.clone(), config);
        Ok(self)
    }

    pub fn integration(&self, name: &str) -> Result<&IntegrationConfig, ConfigError> {
        self.integrations
            .get(name)
            .ok_or_else(|| ConfigError::UnknownIntegration(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.integrations.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IntegrationConfig> {
        self.integrations.values()
    }
}

fn lookup<'a>(mapping: &FieldMapping, record: &'a Record) -> Result<&'a RecordValue, FieldMappingError> {
    record
        .get(&mapping.key)
        .ok_or_else(|| FieldMappingError::MissingKey {
            field: mapping.name.clone(),
            key: mapping.key.clone(),
        })
}

fn invalid(mapping: &FieldMapping, expected: &'static str, found: &RecordValue) -> FieldMappingError {
    FieldMappingError::InvalidValue {
        field: mapping.name.clone(),
        key: mapping.key.clone(),
        expected,
        found: format!("{} `{}`", found.type_name(), found),
    }
}

/// Translate `record` into destination properties, in mapping order.
///
/// Every key is checked before any relation lookup is issued, so a missing
/// key never costs a remote read. Fails on the first offending mapping.
pub async fn build_properties(
    store: &dyn DestinationStore,
    mappings: &[FieldMapping],
    record: &Record,
) -> Result<PropertySet, FieldMappingError> {
    for mapping in mappings {
        lookup(mapping, record)?;
    }

    let mut properties = PropertySet::new();
    for mapping in mappings {
        let value = lookup(mapping, record)?;
        let property = match &mapping.kind {
            FieldKind::Date => match value.as_str() {
                Some(start) if pms_core::is_iso8601(start) => PropertyValue::Date {
                    start: start.to_string(),
                },
                _ => return Err(invalid(mapping, "an ISO-8601 date", value)),
            },
            FieldKind::Number => match value {
                RecordValue::Null => PropertyValue::Number(None),
                RecordValue::Integer(_) | RecordValue::Float(_) => PropertyValue::Number(value.as_f64()),
                RecordValue::Text(_) => return Err(invalid(mapping, "a number", value)),
            },
            FieldKind::Text => PropertyValue::RichText(value.to_string()),
            FieldKind::Select => {
                if value.is_null() {
                    return Err(invalid(mapping, "an option name", value));
                }
                PropertyValue::Select(value.to_string())
            }
            FieldKind::Title => PropertyValue::Title(value.to_string()),
            FieldKind::Relation(target) => {
                PropertyValue::Relation(resolve_relation(store, mapping, target, value).await?)
            }
        };
        properties.insert(mapping.label.clone(), property);
    }
    Ok(properties)
}

async fn resolve_relation(
    store: &dyn DestinationStore,
    mapping: &FieldMapping,
    target: &RelationTarget,
    value: &RecordValue,
) -> Result<Vec<String>, FieldMappingError> {
    let condition = match (target.field_type, value) {
        (_, RecordValue::Null) => return Ok(Vec::new()),
        (LookupKind::Number, v) => match v.as_f64() {
            Some(n) => Condition::equals_number(&target.field_name, n),
            None => return Err(invalid(mapping, "a number", value)),
        },
        (kind, v) => Condition::equals_text(&target.field_name, kind.property_kind(), v.to_string()),
    };

    let rows = store
        .query(&target.table_id, &Filter::single(condition))
        .await
        .map_err(|source| FieldMappingError::RelationLookup {
            field: mapping.name.clone(),
            source,
        })?;
    Ok(rows.into_iter().next().map(|row| row.id).into_iter().collect())
}

/// Soft-fail query result: rows plus the parse failure that emptied them, if any.
#[derive(Debug, Default)]
pub struct LenientQuery {
    pub rows: Vec<DestinationRow>,
    pub invalid_date: Option<InvalidDateError>,
}

/// Date-window reads against a destination table.
#[derive(Clone)]
pub struct PageQuery {
    store: Arc<dyn DestinationStore>,
}

impl PageQuery {
    pub fn new(store: Arc<dyn DestinationStore>) -> Self {
        Self { store }
    }

    pub async fn query_rows(
        &self,
        table_id: &str,
        date_property: &str,
        range: &DateRange,
    ) -> Result<Vec<DestinationRow>, QueryError> {
        let filter = Filter::date_range(date_property, range);
        Ok(self.store.query(table_id, &filter).await?)
    }

    pub async fn query_rows_for_day(
        &self,
        table_id: &str,
        date_property: &str,
        day: &str,
    ) -> Result<Vec<DestinationRow>, QueryError> {
        let range = DateRange::parse_single(day)?;
        self.query_rows(table_id, date_property, &range).await
    }

    /// `[day - 1, day + 1)`.
    pub async fn query_rows_two_day_period(
        &self,
        table_id: &str,
        date_property: &str,
        day: NaiveDate,
    ) -> Result<Vec<DestinationRow>, QueryError> {
        self.query_rows(table_id, date_property, &DateRange::two_day_period(day))
            .await
    }

    /// Malformed dates are logged and yield no rows instead of an error.
    pub async fn query_rows_lenient(
        &self,
        table_id: &str,
        date_property: &str,
        day: &str,
        two_day_period: bool,
    ) -> Result<LenientQuery, StoreError> {
        let day = match parse_day(day) {
            Ok(day) => day,
            Err(err) => {
                warn!(table_id, error = %err, "invalid date in row query; returning no rows");
                return Ok(LenientQuery {
                    rows: Vec::new(),
                    invalid_date: Some(err),
                });
            }
        };
        let range = if two_day_period {
            DateRange::two_day_period(day)
        } else {
            DateRange::single_day(day)
        };
        let filter = Filter::date_range(date_property, &range);
        Ok(LenientQuery {
            rows: self.store.query(table_id, &filter).await?,
            invalid_date: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub action: UpsertAction,
    pub row_id: String,
}

pub fn content_hash(record: &Record) -> String {
    let bytes = serde_json::to_vec(record).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

enum Comparison {
    Number(f64),
    Hash(String),
}

/// Update-if-matched, else create.
#[derive(Clone)]
pub struct ReconciliationEngine {
    config: Arc<IntegrationsConfig>,
    store: Arc<dyn DestinationStore>,
    pages: PageQuery,
}

impl ReconciliationEngine {
    pub fn new(config: Arc<IntegrationsConfig>, store: Arc<dyn DestinationStore>) -> Self {
        Self {
            config,
            pages: PageQuery::new(store.clone()),
            store,
        }
    }

    pub fn config(&self) -> &IntegrationsConfig {
        &self.config
    }

    pub fn pages(&self) -> &PageQuery {
        &self.pages
    }

    /// Match against rows in `window` (or the record's own day when `None`) by
    /// `compare_field`; overwrite the first match or create a new row.
    pub async fn upsert(
        &self,
        integration: &str,
        window: Option<DateRange>,
        record: Record,
        compare_field: &str,
        use_two_day_period: bool,
    ) -> Result<UpsertOutcome, UpsertError> {
        let config = self.config.integration(integration)?;
        let mut properties =
            build_properties(self.store.as_ref(), &config.field_mappings, &record).await?;

        let (label, comparison) = match config.comparison_strategy {
            ComparisonStrategy::Id => {
                let value = record
                    .get(compare_field)
                    .ok_or_else(|| FieldMappingError::MissingKey {
                        field: compare_field.to_string(),
                        key: compare_field.to_string(),
                    })?;
                let number = value.as_f64().ok_or_else(|| UpsertError::ComparisonValue {
                    field: compare_field.to_string(),
                    found: format!("{} `{}`", value.type_name(), value),
                })?;
                (config.comparison_label(compare_field).to_string(), Comparison::Number(number))
            }
            ComparisonStrategy::ContentHash => {
                let hash = content_hash(&record);
                properties.insert(
                    config.comparison_field.clone(),
                    PropertyValue::RichText(hash.clone()),
                );
                (config.comparison_field.clone(), Comparison::Hash(hash))
            }
        };

        let base = match window {
            Some(window) => window,
            None => {
                let key = config
                    .date_key()
                    .ok_or_else(|| UpsertError::MissingDate(integration.to_string()))?;
                let raw = record.get(key).and_then(RecordValue::as_str).unwrap_or_default();
                DateRange::parse_single(raw).map_err(QueryError::from)?
            }
        };
        let window = if use_two_day_period {
            base.with_previous_day()
        } else {
            base
        };

        let candidates = self
            .pages
            .query_rows(&config.table_id, &config.date_property, &window)
            .await?;
        let matched = candidates.iter().find(|row| match &comparison {
            Comparison::Number(n) => row.number(&label) == Some(*n),
            Comparison::Hash(h) => row.text(&label) == Some(h.as_str()),
        });

        match matched {
            Some(row) => {
                let updated = self.store.update(&row.id, &properties).await?;
                info!(integration, window = %window, row_id = %updated.id, "updated existing row");
                Ok(UpsertOutcome {
                    action: UpsertAction::Updated,
                    row_id: updated.id,
                })
            }
            None => {
                let created = self.store.create(&config.table_id, &properties).await?;
                info!(integration, window = %window, row_id = %created.id, "created row");
                Ok(UpsertOutcome {
                    action: UpsertAction::Created,
                    row_id: created.id,
                })
            }
        }
    }

    /// Snapshot integrations: always create, never query.
    pub async fn create_only(&self, integration: &str, record: Record) -> Result<UpsertOutcome, UpsertError> {
        let config = self.config.integration(integration)?;
        let properties =
            build_properties(self.store.as_ref(), &config.field_mappings, &record).await?;
        let created = self.store.create(&config.table_id, &properties).await?;
        info!(integration, row_id = %created.id, "created snapshot row");
        Ok(UpsertOutcome {
            action: UpsertAction::Created,
            row_id: created.id,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    pub record_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub integration: String,
    pub window: DateRange,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub failures: Vec<RecordFailure>,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn message(&self) -> String {
        format!(
            "{} sync for {}: fetched={} created={} updated={} failed={}",
            self.integration, self.window, self.fetched, self.created, self.updated, self.failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Success,
    Error,
}

/// Structured result handed back to whatever triggered the sync.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationResponse {
    pub status: InvocationStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<BatchSummary>,
}

impl InvocationResponse {
    pub fn from_result(result: Result<BatchSummary, SyncError>) -> Self {
        match result {
            Ok(summary) => Self {
                status: if summary.is_success() {
                    InvocationStatus::Success
                } else {
                    InvocationStatus::Error
                },
                message: summary.message(),
                summary: Some(summary),
            },
            Err(err) => Self {
                status: InvocationStatus::Error,
                message: err.to_string(),
                summary: None,
            },
        }
    }
}

fn record_identifier(config: &IntegrationConfig, record: &Record) -> String {
    [config.compare_key.as_str(), "name", "language", "date"]
        .into_iter()
        .find_map(|key| record.get(key).filter(|v| !v.is_null()))
        .map(ToString::to_string)
        .unwrap_or_else(|| "<unidentified>".to_string())
}

pub struct SyncPipeline {
    engine: ReconciliationEngine,
    adapters: BTreeMap<String, Box<dyn IntegrationAdapter>>,
    // integration -> env var it is waiting on
    missing_credentials: BTreeMap<String, &'static str>,
}

impl SyncPipeline {
    pub fn new(config: Arc<IntegrationsConfig>, store: Arc<dyn DestinationStore>) -> Self {
        Self {
            engine: ReconciliationEngine::new(config, store),
            adapters: BTreeMap::new(),
            missing_credentials: BTreeMap::new(),
        }
    }

    /// Eagerly load configuration and register an adapter for every configured
    /// integration whose credentials are present. Integrations without
    /// credentials fail with `ConfigError::MissingCredential` when run.
    pub fn from_settings(settings: &Settings, store: Arc<dyn DestinationStore>) -> Result<Self, ConfigError> {
        let config = Arc::new(IntegrationsConfig::load(&settings.config_path)?);
        let http = Arc::new(
            HttpClient::new(settings.http_config())
                .map_err(|err| ConfigError::HttpClient(err.to_string()))?,
        );

        let mut pipeline = Self::new(config.clone(), store);
        for name in config.names() {
            match adapter_for_integration(name, &settings.credentials, http.clone()) {
                Ok(Some(adapter)) => pipeline = pipeline.with_adapter(adapter),
                Ok(None) => return Err(ConfigError::NoAdapter(name.to_string())),
                Err(AdapterError::MissingCredential { variable, .. }) => {
                    warn!(integration = name, variable, "credential not set; integration disabled");
                    pipeline.missing_credentials.insert(name.to_string(), variable);
                }
                Err(_) => return Err(ConfigError::NoAdapter(name.to_string())),
            }
        }
        Ok(pipeline)
    }

    pub fn with_adapter(mut self, adapter: Box<dyn IntegrationAdapter>) -> Self {
        self.adapters.insert(adapter.integration().to_string(), adapter);
        self
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn config(&self) -> &IntegrationsConfig {
        self.engine.config()
    }

    /// Fetch one integration's records for `window` and reconcile them one at a time.
    ///
    /// Per-record failures are logged and counted; only configuration and
    /// fetch failures abort the batch.
    pub async fn run_integration(&self, integration: &str, window: DateRange) -> Result<BatchSummary, SyncError> {
        let config = self.config().integration(integration)?;
        let adapter = match self.adapters.get(integration) {
            Some(adapter) => adapter,
            None => {
                return Err(match self.missing_credentials.get(integration) {
                    Some(&variable) => ConfigError::MissingCredential {
                        integration: integration.to_string(),
                        variable,
                    },
                    None => ConfigError::NoAdapter(integration.to_string()),
                }
                .into())
            }
        };

        let ctx = AdapterContext::now();
        let span = info_span!("sync_run", run_id = %ctx.run_id, integration, window = %window);
        async move {
            let started_at = Utc::now();
            info!("starting sync");
            let fetched = adapter
                .fetch(&ctx, &window)
                .await
                .map_err(|source| SyncError::Fetch {
                    integration: integration.to_string(),
                    source,
                })?;

            let mut summary = BatchSummary {
                run_id: ctx.run_id,
                integration: integration.to_string(),
                window,
                started_at,
                finished_at: started_at,
                fetched: fetched.total(),
                created: 0,
                updated: 0,
                failed: fetched.rejected.len(),
                failures: fetched
                    .rejected
                    .into_iter()
                    .map(|rejected| RecordFailure {
                        record_id: rejected.source_id,
                        error: rejected.error,
                    })
                    .collect(),
            };

            let window_hint = if config.date_key().is_some() {
                None
            } else {
                Some(window)
            };

            for record in fetched.records {
                let record_id = record_identifier(config, &record);
                let result = match config.mode {
                    SyncMode::CreateOnly => self.engine.create_only(integration, record).await,
                    SyncMode::Upsert => {
                        self.engine
                            .upsert(
                                integration,
                                window_hint,
                                record,
                                &config.compare_key,
                                config.two_day_period,
                            )
                            .await
                    }
                };
                match result {
                    Ok(outcome) => match outcome.action {
                        UpsertAction::Created => summary.created += 1,
                        UpsertAction::Updated => summary.updated += 1,
                    },
                    Err(err) => {
                        error!(record = %record_id, error = %err, "record sync failed");
                        summary.failed += 1;
                        summary.failures.push(RecordFailure {
                            record_id,
                            error: err.to_string(),
                        });
                    }
                }
            }

            summary.finished_at = Utc::now();
            info!(
                fetched = summary.fetched,
                created = summary.created,
                updated = summary.updated,
                failed = summary.failed,
                "sync complete"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    pub async fn run_for_day(&self, integration: &str, day: NaiveDate) -> Result<BatchSummary, SyncError> {
        self.run_integration(integration, DateRange::single_day(day)).await
    }
}

/// Window for a triggered sync: `date` alone is one day, `end_date` is exclusive,
/// and no date at all means `today`.
pub fn resolve_window(
    date: Option<&str>,
    end_date: Option<&str>,
    today: NaiveDate,
) -> Result<DateRange, InvalidDateError> {
    let start = date.map(parse_day).transpose()?.unwrap_or(today);
    match end_date {
        Some(end) => DateRange::between(start, parse_day(end)?),
        None => Ok(DateRange::single_day(start)),
    }
}

/// `(integration, cron)` pairs for every integration that declares a schedule.
pub fn scheduled_jobs(config: &IntegrationsConfig) -> Vec<(String, String)> {
    config
        .iter()
        .filter_map(|c| c.schedule.clone().map(|cron| (c.name.clone(), cron)))
        .collect()
}

pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> anyhow::Result<Option<JobScheduler>> {
    let jobs = scheduled_jobs(pipeline.config());
    if jobs.is_empty() {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for (integration, cron) in jobs {
        let job_pipeline = pipeline.clone();
        let job_integration = integration.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = job_pipeline.clone();
            let integration = job_integration.clone();
            Box::pin(async move {
                let today = Utc::now().date_naive();
                let response =
                    InvocationResponse::from_result(pipeline.run_for_day(&integration, today).await);
                match response.status {
                    InvocationStatus::Success => info!(%integration, message = %response.message, "scheduled sync finished"),
                    InvocationStatus::Error => error!(%integration, message = %response.message, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for {integration} ({cron})"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%integration, %cron, "scheduled sync job");
    }
    Ok(Some(sched))
}

/// Build a pipeline against the workspace API from environment settings.
pub fn pipeline_from_env() -> anyhow::Result<SyncPipeline> {
    let settings = Settings::from_env()?;
    let store: Arc<dyn DestinationStore> = Arc::new(settings.notion_store()?);
    Ok(SyncPipeline::from_settings(&settings, store)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pms_adapters::{transform_workout, FetchedRecords, WHOOP_WORKOUT};
    use pms_storage::MemoryStore;

    const CONFIG: &str = r#"
lingq:
  table_id: lingq-db
  mode: create_only
  field_mappings:
    date: { type: date, label: Date, key: date }
    language: { type: select, label: Language, key: language }
    word_count: { type: number, label: Known Words, key: word-count }
whoop-workout:
  table_id: workout-db
  schedule: "0 0 22 * * *"
  field_mappings:
    title: { type: title, label: Name, key: title }
    id: { type: number, label: Whoop ID, key: id }
    date: { type: date, label: Date, key: date }
    sport: { type: select, label: Sport, key: sport }
whoop-sleep-and-recovery:
  database_id: sleep-db
  two_day_period: true
  field_mappings:
    name: { type: title, label: Name, key: name }
    id: { type: number, label: Sleep ID, key: id }
    date: { type: date, label: Date, key: date }
    recovery: { type: number, label: Recovery, key: recovery_score }
    day: { type: relation, label: Day, key: date, relation: { table_id: days-db, field_name: Name } }
"#;

    fn config() -> Arc<IntegrationsConfig> {
        Arc::new(IntegrationsConfig::from_yaml_str(CONFIG).expect("config"))
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn workout(id: i64, sport: &str, date: &str) -> Record {
        Record::new()
            .with("id", id)
            .with("title", sport)
            .with("sport", sport)
            .with("date", date)
    }

    fn props(entries: Vec<(&str, PropertyValue)>) -> PropertySet {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn config_parses_defaults_and_keeps_mapping_order() {
        let config = config();
        let workout = config.integration("whoop-workout").unwrap();
        assert_eq!(workout.comparison_field, "Custom ID");
        assert_eq!(workout.date_property, "Date");
        assert_eq!(workout.mode, SyncMode::Upsert);
        assert_eq!(workout.compare_key, "id");
        let order = workout.field_mappings.iter().map(|m| m.name.as_str()).collect::<Vec<_>>();
        assert_eq!(order, vec!["title", "id", "date", "sport"]);
        assert_eq!(workout.comparison_label("id"), "Whoop ID");
        assert_eq!(workout.comparison_label("external"), "Custom ID");

        let sleep = config.integration("whoop-sleep-and-recovery").unwrap();
        assert_eq!(sleep.table_id, "sleep-db");
        assert!(sleep.two_day_period);
        assert_eq!(
            sleep.field_mappings[4].kind,
            FieldKind::Relation(RelationTarget {
                table_id: "days-db".into(),
                field_name: "Name".into(),
                field_type: LookupKind::Title,
            })
        );
        assert_eq!(config.integration("lingq").unwrap().mode, SyncMode::CreateOnly);
        assert!(matches!(
            config.integration("strava"),
            Err(ConfigError::UnknownIntegration(_))
        ));
    }

    #[test]
    fn unsupported_field_type_is_rejected_at_load() {
        let err = IntegrationsConfig::from_yaml_str(
            "x:\n  table_id: t\n  field_mappings:\n    mood: { type: checkbox, label: Mood, key: mood }\n",
        )
        .unwrap_err();
        match err {
            ConfigError::Mapping {
                source: FieldMappingError::UnsupportedType { field, type_name },
                ..
            } => {
                assert_eq!(field, "mood");
                assert_eq!(type_name, "checkbox");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn id_comparison_requires_a_numeric_mapping() {
        let err = IntegrationsConfig::from_yaml_str(
            "x:\n  table_id: t\n  field_mappings:\n    id: { type: text, label: External, key: id }\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::NonNumericComparison { field, .. } if field == "id"));

        // snapshots never compare, and hashes ignore the id mapping's type
        for extra in ["  mode: create_only\n", "  comparison_strategy: content_hash\n"] {
            let yaml = format!(
                "x:\n  table_id: t\n{extra}  field_mappings:\n    id: {{ type: text, label: External, key: id }}\n"
            );
            assert!(IntegrationsConfig::from_yaml_str(&yaml).is_ok(), "{extra}");
        }
    }

    #[test]
    fn content_hash_property_cannot_share_a_mapped_label() {
        let err = IntegrationsConfig::from_yaml_str(
            "x:\n  table_id: t\n  comparison_strategy: content_hash\n  field_mappings:\n    ref: { type: text, label: Custom ID, key: ref }\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateLabel { label, .. } if label == "Custom ID"));
    }

    #[test]
    fn relation_without_target_and_duplicate_labels_are_rejected() {
        let err = IntegrationsConfig::from_yaml_str(
            "x:\n  table_id: t\n  field_mappings:\n    day: { type: relation, label: Day, key: date }\n",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Mapping {
                source: FieldMappingError::MissingRelation { .. },
                ..
            }
        ));

        let err = IntegrationsConfig::from_yaml_str(
            "x:\n  table_id: t\n  field_mappings:\n    a: { type: number, label: Same, key: a }\n    b: { type: number, label: Same, key: b }\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateLabel { label, .. } if label == "Same"));
    }

    #[test]
    fn config_file_load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notion.config.yml");
        assert!(matches!(
            IntegrationsConfig::load(&path),
            Err(ConfigError::Read { .. })
        ));
        std::fs::write(&path, CONFIG).unwrap();
        let loaded = IntegrationsConfig::load(&path).unwrap();
        assert_eq!(loaded.names().count(), 3);
    }

    #[test]
    fn settings_require_notion_token() {
        let err = Settings::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv("NOTION_TOKEN")));

        let settings = Settings::from_lookup(|key| match key {
            "NOTION_TOKEN" => Some("secret".into()),
            "WHOOP_ACCESS_TOKEN" => Some("whoop".into()),
            "PMS_HTTP_TIMEOUT_SECS" => Some("5".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(settings.http_timeout_secs, 5);
        assert!(settings.credentials.lingq.is_none());
        assert_eq!(
            settings.credentials.whoop.as_ref().map(|w| w.api_url.as_str()),
            Some(DEFAULT_WHOOP_API_URL)
        );
    }

    #[tokio::test]
    async fn build_properties_emits_one_property_per_mapping() {
        let store = MemoryStore::new();
        let mappings = vec![FieldMapping::new("id", "Whoop ID", FieldKind::Number)];
        let record = Record::new().with("id", 42).with("sport", "Run");
        let built = build_properties(&store, &mappings, &record).await.unwrap();
        assert_eq!(built, props(vec![("Whoop ID", PropertyValue::Number(Some(42.0)))]));

        let config = config();
        let built = build_properties(
            &store,
            &config.integration("whoop-workout").unwrap().field_mappings,
            &workout(7, "Running", "2024-03-09T07:00:00+00:00"),
        )
        .await
        .unwrap();
        assert_eq!(built.get("Name"), Some(&PropertyValue::Title("Running".into())));
        assert_eq!(built.get("Sport"), Some(&PropertyValue::Select("Running".into())));
        assert_eq!(
            built.get("Date"),
            Some(&PropertyValue::Date {
                start: "2024-03-09T07:00:00+00:00".into()
            })
        );
    }

    #[tokio::test]
    async fn missing_key_fails_without_touching_the_store() {
        let store = MemoryStore::new();
        let config = config();
        let mappings = &config.integration("whoop-sleep-and-recovery").unwrap().field_mappings;
        let record = Record::new().with("id", 1).with("date", "2024-03-09").with("name", "2024-03-09");
        let err = build_properties(&store, mappings, &record).await.unwrap_err();
        match err {
            FieldMappingError::MissingKey { field, key } => {
                assert_eq!(field, "recovery");
                assert_eq!(key, "recovery_score");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(store.calls().await.queries, 0);
    }

    #[tokio::test]
    async fn values_are_not_coerced() {
        let store = MemoryStore::new();
        let number = vec![FieldMapping::new("id", "Whoop ID", FieldKind::Number)];
        let err = build_properties(&store, &number, &Record::new().with("id", "42"))
            .await
            .unwrap_err();
        assert!(matches!(err, FieldMappingError::InvalidValue { expected: "a number", .. }));

        let date = vec![FieldMapping::new("date", "Date", FieldKind::Date)];
        let err = build_properties(&store, &date, &Record::new().with("date", "yesterday"))
            .await
            .unwrap_err();
        assert!(matches!(err, FieldMappingError::InvalidValue { .. }));

        let nullable = build_properties(&store, &number, &Record::new().with("id", RecordValue::Null))
            .await
            .unwrap();
        assert_eq!(nullable.get("Whoop ID"), Some(&PropertyValue::Number(None)));
    }

    #[tokio::test]
    async fn relation_resolves_first_match_or_empty() {
        let store = MemoryStore::new();
        let target = RelationTarget {
            table_id: "days-db".into(),
            field_name: "Name".into(),
            field_type: LookupKind::Title,
        };
        let mappings = vec![FieldMapping::new("date", "Day", FieldKind::Relation(target))];
        let record = Record::new().with("date", "2024-03-09");

        let empty = build_properties(&store, &mappings, &record).await.unwrap();
        assert_eq!(empty.get("Day"), Some(&PropertyValue::Relation(vec![])));

        let day_id = store
            .seed("days-db", props(vec![("Name", PropertyValue::Title("2024-03-09".into()))]))
            .await;
        let linked = build_properties(&store, &mappings, &record).await.unwrap();
        assert_eq!(linked.get("Day"), Some(&PropertyValue::Relation(vec![day_id])));
    }

    struct UnreachableStore;

    #[async_trait]
    impl DestinationStore for UnreachableStore {
        async fn query(&self, _table_id: &str, _filter: &Filter) -> Result<Vec<DestinationRow>, StoreError> {
            Err(StoreError::MalformedResponse("connection reset".into()))
        }

        async fn create(&self, _table_id: &str, _properties: &PropertySet) -> Result<DestinationRow, StoreError> {
            Err(StoreError::MalformedResponse("connection reset".into()))
        }

        async fn update(&self, _row_id: &str, _properties: &PropertySet) -> Result<DestinationRow, StoreError> {
            Err(StoreError::MalformedResponse("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn relation_lookup_failures_surface_as_store_faults() {
        let engine = ReconciliationEngine::new(config(), Arc::new(UnreachableStore));
        let record = Record::new()
            .with("id", 5)
            .with("name", "2024-03-09")
            .with("date", "2024-03-09")
            .with("recovery_score", 61);

        let err = engine
            .upsert("whoop-sleep-and-recovery", None, record, "id", false)
            .await
            .unwrap_err();
        assert!(matches!(err, UpsertError::Query(QueryError::Store(_))), "{err:?}");

        let missing = engine
            .upsert("whoop-sleep-and-recovery", None, Record::new().with("id", 5), "id", false)
            .await
            .unwrap_err();
        assert!(matches!(missing, UpsertError::Mapping(FieldMappingError::MissingKey { .. })));
    }

    #[tokio::test]
    async fn lenient_query_reports_invalid_dates() {
        let store = Arc::new(MemoryStore::new());
        let pages = PageQuery::new(store.clone());
        let result = pages
            .query_rows_lenient("workout-db", "Date", "31/02/2024", false)
            .await
            .unwrap();
        assert!(result.rows.is_empty());
        assert!(matches!(result.invalid_date, Some(InvalidDateError::Unparseable { .. })));
        assert_eq!(store.calls().await.queries, 0);

        let strict = pages.query_rows_for_day("workout-db", "Date", "31/02/2024").await;
        assert!(matches!(strict, Err(QueryError::InvalidDate(_))));
    }

    #[tokio::test]
    async fn two_day_query_covers_previous_day_only() {
        let store = Arc::new(MemoryStore::new());
        for d in ["2024-03-07", "2024-03-08", "2024-03-09", "2024-03-10"] {
            store
                .seed("sleep-db", props(vec![("Date", PropertyValue::Date { start: d.into() })]))
                .await;
        }
        let rows = PageQuery::new(store.clone())
            .query_rows_two_day_period("sleep-db", "Date", day("2024-03-09"))
            .await
            .unwrap();
        let days = rows.iter().filter_map(|r| r.date_start("Date")).collect::<Vec<_>>();
        assert_eq!(days, vec!["2024-03-08", "2024-03-09"]);
    }

    #[tokio::test]
    async fn upsert_updates_row_with_same_external_id() {
        let store = Arc::new(MemoryStore::new());
        let engine = ReconciliationEngine::new(config(), store.clone());
        let existing = store
            .seed(
                "workout-db",
                props(vec![
                    ("Whoop ID", PropertyValue::Number(Some(42.0))),
                    ("Date", PropertyValue::Date { start: "2024-03-09T07:00:00+00:00".into() }),
                    ("Sport", PropertyValue::Select("Run".into())),
                ]),
            )
            .await;

        let outcome = engine
            .upsert(
                "whoop-workout",
                Some(DateRange::single_day(day("2024-03-09"))),
                workout(42, "Run (corrected)", "2024-03-09T07:00:00+00:00"),
                "id",
                false,
            )
            .await
            .unwrap();
        assert_eq!(outcome.action, UpsertAction::Updated);
        assert_eq!(outcome.row_id, existing);

        let rows = store.rows("workout-db").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text("Sport"), Some("Run (corrected)"));
    }

    #[tokio::test]
    async fn upsert_rejects_non_numeric_comparison_values() {
        let store = Arc::new(MemoryStore::new());
        let engine = ReconciliationEngine::new(config(), store.clone());
        let record = Record::new()
            .with("id", "abc")
            .with("title", "Run")
            .with("sport", "Run")
            .with("date", "2024-03-09");
        // The number mapping rejects the text id before the comparison is attempted.
        let err = engine
            .upsert("whoop-workout", None, record, "id", false)
            .await
            .unwrap_err();
        assert!(matches!(err, UpsertError::Mapping(FieldMappingError::InvalidValue { .. })));

        let record = workout(1, "Run", "2024-03-09").with("external", "abc");
        let err = engine
            .upsert("whoop-workout", None, record, "external", false)
            .await
            .unwrap_err();
        assert!(matches!(err, UpsertError::ComparisonValue { .. }));
        assert_eq!(store.calls().await.creates, 0);
    }

    #[tokio::test]
    async fn content_hash_strategy_matches_identical_records() {
        let config = IntegrationsConfig::default()
            .with_integration(IntegrationConfig {
                comparison_strategy: ComparisonStrategy::ContentHash,
                ..IntegrationConfig::new(
                    "hashed",
                    "hash-db",
                    vec![
                        FieldMapping::new("date", "Date", FieldKind::Date),
                        FieldMapping::new("sport", "Sport", FieldKind::Select),
                    ],
                )
            })
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = ReconciliationEngine::new(Arc::new(config), store.clone());
        let record = Record::new().with("date", "2024-03-09").with("sport", "Run");

        let first = engine
            .upsert("hashed", None, record.clone(), "id", false)
            .await
            .unwrap();
        let second = engine.upsert("hashed", None, record.clone(), "id", false).await.unwrap();
        assert_eq!(first.action, UpsertAction::Created);
        assert_eq!(second.action, UpsertAction::Updated);
        assert_eq!(first.row_id, second.row_id);

        let rows = store.rows("hash-db").await;
        assert_eq!(rows[0].text("Custom ID"), Some(content_hash(&record).as_str()));

        let drifted = record.with("sport", "Ride");
        let third = engine.upsert("hashed", None, drifted, "id", false).await.unwrap();
        assert_eq!(third.action, UpsertAction::Created);
    }

    struct FixedAdapter {
        name: &'static str,
        records: Vec<Record>,
    }

    #[async_trait]
    impl IntegrationAdapter for FixedAdapter {
        fn integration(&self) -> &'static str {
            self.name
        }

        async fn fetch(&self, _ctx: &AdapterContext, _window: &DateRange) -> Result<FetchedRecords, AdapterError> {
            Ok(self.records.clone().into())
        }
    }

    struct FailingAdapter;

    #[async_trait]
    impl IntegrationAdapter for FailingAdapter {
        fn integration(&self) -> &'static str {
            "whoop-workout"
        }

        async fn fetch(&self, _ctx: &AdapterContext, _window: &DateRange) -> Result<FetchedRecords, AdapterError> {
            Err(AdapterError::Message("401 unauthorized".into()))
        }
    }

    struct WorkoutPayloads(Vec<serde_json::Value>);

    #[async_trait]
    impl IntegrationAdapter for WorkoutPayloads {
        fn integration(&self) -> &'static str {
            "whoop-workout"
        }

        async fn fetch(&self, _ctx: &AdapterContext, _window: &DateRange) -> Result<FetchedRecords, AdapterError> {
            Ok(FetchedRecords::shape(WHOOP_WORKOUT, &self.0, transform_workout))
        }
    }

    #[tokio::test]
    async fn malformed_source_payload_is_counted_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = SyncPipeline::new(config(), store.clone()).with_adapter(Box::new(WorkoutPayloads(vec![
            serde_json::json!({
                "id": 1, "sport_id": 0,
                "start": "2024-03-09T07:00:00Z", "end": "2024-03-09T07:45:00Z"
            }),
            serde_json::json!({ "id": 2, "sport_id": 0, "start": "2024-03-09T18:00:00Z" }),
        ])));

        let summary = pipeline
            .run_for_day("whoop-workout", day("2024-03-09"))
            .await
            .unwrap();
        assert_eq!(summary.fetched, 2);
        assert_eq!(summary.created, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].record_id, "2");
        assert!(summary.failures[0].error.contains("end"));
        assert_eq!(store.rows("workout-db").await.len(), 1);
    }

    #[tokio::test]
    async fn batch_continues_past_bad_records() {
        let store = Arc::new(MemoryStore::new());
        let bad = Record::new().with("id", 2).with("title", "Ride").with("date", "2024-03-09");
        let pipeline = SyncPipeline::new(config(), store.clone()).with_adapter(Box::new(FixedAdapter {
            name: "whoop-workout",
            records: vec![
                workout(1, "Run", "2024-03-09T07:00:00+00:00"),
                bad,
                workout(3, "Swim", "2024-03-09T18:00:00+00:00"),
            ],
        }));

        let summary = pipeline
            .run_for_day("whoop-workout", day("2024-03-09"))
            .await
            .unwrap();
        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.created, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].record_id, "2");
        assert!(summary.failures[0].error.contains("sport"));
        assert!(!summary.is_success());

        let response = InvocationResponse::from_result(Ok(summary));
        assert_eq!(response.status, InvocationStatus::Error);
        assert!(response.message.contains("failed=1"));
    }

    #[tokio::test]
    async fn create_only_integrations_never_query() {
        let store = Arc::new(MemoryStore::new());
        let snapshot = Record::new()
            .with("date", "2024-03-09T21:30:00Z")
            .with("language", "Spanish")
            .with("word-count", 5123);
        let pipeline = SyncPipeline::new(config(), store.clone()).with_adapter(Box::new(FixedAdapter {
            name: "lingq",
            records: vec![snapshot.clone(), snapshot],
        }));

        let summary = pipeline.run_for_day("lingq", day("2024-03-09")).await.unwrap();
        assert_eq!(summary.created, 2);
        assert!(summary.is_success());
        let calls = store.calls().await;
        assert_eq!(calls.queries, 0);
        assert_eq!(calls.creates, 2);
    }

    #[tokio::test]
    async fn fetch_failures_abort_the_invocation() {
        let pipeline = SyncPipeline::new(config(), Arc::new(MemoryStore::new()))
            .with_adapter(Box::new(FailingAdapter));
        let result = pipeline.run_for_day("whoop-workout", day("2024-03-09")).await;
        assert!(matches!(result, Err(SyncError::Fetch { .. })));

        let response = InvocationResponse::from_result(result);
        assert_eq!(response.status, InvocationStatus::Error);
        assert!(response.summary.is_none());

        let missing = pipeline.run_for_day("lingq", day("2024-03-09")).await;
        assert!(matches!(missing, Err(SyncError::Config(ConfigError::NoAdapter(_)))));
    }

    #[tokio::test]
    async fn missing_credentials_only_fail_the_integration_that_needs_them() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notion.config.yml");
        std::fs::write(&path, CONFIG).unwrap();
        let config_path = path.display().to_string();
        let settings = Settings::from_lookup(|key| match key {
            "NOTION_TOKEN" => Some("secret".into()),
            "LINGQ_API_KEY" => Some("lingq".into()),
            "PMS_CONFIG" => Some(config_path.clone()),
            _ => None,
        })
        .unwrap();

        let store = Arc::new(MemoryStore::new());
        let pipeline = SyncPipeline::from_settings(&settings, store.clone()).unwrap();
        let err = pipeline
            .run_for_day("whoop-workout", day("2024-03-09"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Config(ConfigError::MissingCredential {
                variable: "WHOOP_ACCESS_TOKEN",
                ..
            })
        ));
        assert_eq!(store.calls().await.queries, 0);
    }

    #[test]
    fn trigger_windows_default_to_today() {
        let today = day("2024-03-09");
        assert_eq!(resolve_window(None, None, today).unwrap(), DateRange::single_day(today));
        let range = resolve_window(Some("2024-03-01"), Some("2024-03-04"), today).unwrap();
        assert_eq!(range.start(), day("2024-03-01"));
        assert_eq!(range.end_exclusive(), day("2024-03-04"));
        assert!(resolve_window(Some("2024-03-04"), Some("2024-03-04"), today).is_err());
        assert!(resolve_window(Some("soon"), None, today).is_err());
    }

    #[test]
    fn only_integrations_with_schedules_get_jobs() {
        let jobs = scheduled_jobs(&config());
        assert_eq!(jobs, vec![("whoop-workout".to_string(), "0 0 22 * * *".to_string())]);
    }
}
