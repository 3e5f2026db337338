//! Integration adapter contracts + LingQ / Whoop adapter implementations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use pms_core::{DateRange, Record, RecordValue};
use pms_storage::{HttpClient, HttpError};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pms-adapters";

pub const LINGQ: &str = "lingq";
pub const WHOOP_WORKOUT: &str = "whoop-workout";
pub const WHOOP_SLEEP_AND_RECOVERY: &str = "whoop-sleep-and-recovery";

pub const DEFAULT_LINGQ_API_URL: &str = "https://www.lingq.com/api/v2";
pub const DEFAULT_WHOOP_API_URL: &str = "https://api.prod.whoop.com/developer";

const KILOJOULE_TO_KCAL: f64 = 0.239006;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn now() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("{integration} payload is missing `{field}`")]
    MissingField {
        integration: &'static str,
        field: String,
    },
    #[error("missing credential {variable} for integration {integration}")]
    MissingCredential {
        integration: String,
        variable: &'static str,
    },
    #[error("{0}")]
    Message(String),
}

/// A source payload that could not be shaped into a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    pub source_id: String,
    pub error: String,
}

/// Records for one window plus the payloads that were skipped while shaping them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedRecords {
    pub records: Vec<Record>,
    pub rejected: Vec<RejectedRecord>,
}

impl FetchedRecords {
    /// Shape every payload, keeping the good records and recording the rest.
    pub fn shape<F>(integration: &'static str, payloads: &[JsonValue], transform: F) -> Self
    where
        F: Fn(&JsonValue) -> Result<Record, AdapterError>,
    {
        let mut fetched = Self::default();
        for (index, payload) in payloads.iter().enumerate() {
            match transform(payload) {
                Ok(record) => fetched.records.push(record),
                Err(err) => {
                    let source_id = json_path(payload, &["id"])
                        .filter(|id| !id.is_null())
                        .map(|id| id.as_str().map(str::to_string).unwrap_or_else(|| id.to_string()))
                        .unwrap_or_else(|| format!("#{index}"));
                    warn!(integration, %source_id, error = %err, "skipping malformed payload");
                    fetched.rejected.push(RejectedRecord {
                        source_id,
                        error: err.to_string(),
                    });
                }
            }
        }
        fetched
    }

    pub fn total(&self) -> usize {
        self.records.len() + self.rejected.len()
    }
}

impl From<Vec<Record>> for FetchedRecords {
    fn from(records: Vec<Record>) -> Self {
        Self {
            records,
            rejected: Vec::new(),
        }
    }
}

/// One source service: produces normalized records for a day window.
///
/// Transport and credential failures are errors; a single malformed payload
/// lands in `FetchedRecords::rejected` instead.
#[async_trait]
pub trait IntegrationAdapter: Send + Sync {
    fn integration(&self) -> &'static str;

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        window: &DateRange,
    ) -> Result<FetchedRecords, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct LingqConfig {
    pub api_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct WhoopConfig {
    pub api_url: String,
    pub access_token: String,
}

/// Credentials gathered from the environment; absent entries disable the integration.
#[derive(Debug, Clone, Default)]
pub struct AdapterCredentials {
    pub lingq: Option<LingqConfig>,
    pub whoop: Option<WhoopConfig>,
}

#[derive(Debug, Deserialize)]
struct LingqLanguage {
    title: String,
    #[serde(rename = "knownWords", default)]
    known_words: i64,
}

pub struct LingqAdapter {
    http: Arc<HttpClient>,
    config: LingqConfig,
}

impl LingqAdapter {
    pub fn new(http: Arc<HttpClient>, config: LingqConfig) -> Self {
        Self { http, config }
    }
}

/// One word-count snapshot per language with at least one known word.
pub fn word_count_records(payload: &JsonValue, fetched_at: DateTime<Utc>) -> Result<Vec<Record>, AdapterError> {
    let languages: Vec<LingqLanguage> = serde_json::from_value(payload.clone())
        .map_err(|err| AdapterError::Message(format!("decoding lingq languages: {err}")))?;
    let date = fetched_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    Ok(languages
        .into_iter()
        .filter(|language| language.known_words > 0)
        .map(|language| {
            Record::new()
                .with("date", date.clone())
                .with("language", language.title)
                .with("word-count", language.known_words)
        })
        .collect())
}

#[async_trait]
impl IntegrationAdapter for LingqAdapter {
    fn integration(&self) -> &'static str {
        LINGQ
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        _window: &DateRange,
    ) -> Result<FetchedRecords, AdapterError> {
        let url = format!("{}/languages", self.config.api_url.trim_end_matches('/'));
        let request = self
            .http
            .request(Method::GET, &url)
            .header("Authorization", format!("Token {}", self.config.api_key))
            .header("accept", "application/json");
        let payload = self.http.send_json(request).await?;
        let records = word_count_records(&payload, ctx.fetched_at)?;
        info!(run_id = %ctx.run_id, languages = records.len(), "fetched lingq word counts");
        Ok(records.into())
    }
}

/// Thin client over the Whoop developer collections.
pub struct WhoopApi {
    http: Arc<HttpClient>,
    config: WhoopConfig,
}

impl WhoopApi {
    pub fn new(http: Arc<HttpClient>, config: WhoopConfig) -> Self {
        Self { http, config }
    }

    /// All records of a paged collection whose start falls inside `window`.
    pub async fn collection(&self, path: &str, window: &DateRange) -> Result<Vec<JsonValue>, AdapterError> {
        let base = format!("{}{}", self.config.api_url.trim_end_matches('/'), path);
        let start = day_start_utc(window.start());
        let end = day_start_utc(window.end_exclusive());
        let mut records = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("start", start.clone()),
                ("end", end.clone()),
                ("limit", "25".to_string()),
            ];
            if let Some(token) = &next_token {
                params.push(("nextToken", token.clone()));
            }
            let url = Url::parse_with_params(&base, &params).map_err(|err| AdapterError::InvalidUrl {
                url: base.clone(),
                reason: err.to_string(),
            })?;
            let request = self
                .http
                .request(Method::GET, url.as_str())
                .bearer_auth(&self.config.access_token);
            let page = self.http.send_json(request).await?;

            if let Some(items) = page.get("records").and_then(JsonValue::as_array) {
                records.extend(items.iter().cloned());
            }
            next_token = page
                .get("next_token")
                .and_then(JsonValue::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        debug!(path, window = %window, records = records.len(), "fetched whoop collection");
        Ok(records)
    }
}

fn day_start_utc(day: NaiveDate) -> String {
    day.and_time(NaiveTime::MIN)
        .and_utc()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_path(value, path).and_then(JsonValue::as_f64)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_path(value, path).and_then(JsonValue::as_str)
}

fn require_f64(integration: &'static str, value: &JsonValue, path: &[&str]) -> Result<f64, AdapterError> {
    json_f64(value, path).ok_or_else(|| AdapterError::MissingField {
        integration,
        field: path.join("."),
    })
}

fn require_str<'a>(integration: &'static str, value: &'a JsonValue, path: &[&str]) -> Result<&'a str, AdapterError> {
    json_str(value, path).ok_or_else(|| AdapterError::MissingField {
        integration,
        field: path.join("."),
    })
}

fn require_id(integration: &'static str, value: &JsonValue) -> Result<i64, AdapterError> {
    json_path(value, &["id"])
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| AdapterError::MissingField {
            integration,
            field: "id".into(),
        })
}

fn parse_timestamp(integration: &'static str, field: &str, raw: &str) -> Result<DateTime<Utc>, AdapterError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| AdapterError::Message(format!("{integration}: invalid {field} `{raw}`: {err}")))
}

pub fn sport_name(sport_id: i64) -> &'static str {
    match sport_id {
        -1 => "Activity",
        0 => "Running",
        1 => "Cycling",
        16 => "Baseball",
        17 => "Basketball",
        18 => "Rowing",
        19 => "Fencing",
        20 => "Field Hockey",
        21 => "Football",
        22 => "Golf",
        24 => "Ice Hockey",
        25 => "Lacrosse",
        27 => "Rugby",
        28 => "Sailing",
        29 => "Skiing",
        30 => "Soccer",
        31 => "Softball",
        32 => "Squash",
        33 => "Swimming",
        34 => "Tennis",
        35 => "Track & Field",
        36 => "Volleyball",
        37 => "Water Polo",
        38 => "Wrestling",
        39 => "Boxing",
        42 => "Dance",
        43 => "Pilates",
        44 => "Yoga",
        45 => "Weightlifting",
        47 => "Cross Country Skiing",
        48 => "Functional Fitness",
        49 => "Duathlon",
        51 => "Gymnastics",
        52 => "Hiking/Rucking",
        53 => "Horseback Riding",
        55 => "Kayaking",
        56 => "Martial Arts",
        57 => "Mountain Biking",
        59 => "Powerlifting",
        60 => "Rock Climbing",
        61 => "Paddleboarding",
        62 => "Triathlon",
        63 => "Walking",
        64 => "Surfing",
        65 => "Elliptical",
        66 => "Stairmaster",
        70 => "Meditation",
        71 => "Other",
        73 => "Diving",
        84 => "Jumping Rope",
        96 => "HIIT",
        97 => "Spin",
        98 => "Jiu Jitsu",
        101 => "Pickleball",
        121 => "Padel",
        126 => "Assault Bike",
        _ => "Unknown",
    }
}

/// Workout payload -> `{id, title, date, duration, distance, sport, calories, hr_avg, hr_max}`.
pub fn transform_workout(entry: &JsonValue) -> Result<Record, AdapterError> {
    let id = require_id(WHOOP_WORKOUT, entry)?;
    let start = parse_timestamp(WHOOP_WORKOUT, "start", require_str(WHOOP_WORKOUT, entry, &["start"])?)?;
    let end = parse_timestamp(WHOOP_WORKOUT, "end", require_str(WHOOP_WORKOUT, entry, &["end"])?)?;

    let duration_minutes = ((end - start).num_seconds() as f64 / 60.0).round() as i64;
    let distance_km = (json_f64(entry, &["score", "distance_meter"]).unwrap_or(0.0) / 100.0).round() / 10.0;
    let calories = (json_f64(entry, &["score", "kilojoule"]).unwrap_or(0.0) * KILOJOULE_TO_KCAL).round() as i64;
    let hr_avg = json_f64(entry, &["score", "average_heart_rate"]).unwrap_or(0.0);
    let hr_max = json_f64(entry, &["score", "max_heart_rate"]).unwrap_or(0.0);
    let sport = sport_name(
        json_path(entry, &["sport_id"])
            .and_then(JsonValue::as_i64)
            .unwrap_or(0),
    );

    Ok(Record::new()
        .with("id", id)
        .with("title", sport)
        .with("date", start.to_rfc3339())
        .with("duration", duration_minutes)
        .with("distance", distance_km)
        .with("sport", sport)
        .with("calories", calories)
        .with("hr_avg", numeric(hr_avg))
        .with("hr_max", numeric(hr_max)))
}

fn numeric(value: f64) -> RecordValue {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        RecordValue::Integer(value as i64)
    } else {
        RecordValue::Float(value)
    }
}

/// Merge one sleep and one recovery payload into a single nightly record dated by wake-up day.
pub fn combine_sleep_and_recovery(sleep: &JsonValue, recovery: &JsonValue) -> Result<Record, AdapterError> {
    const I: &str = WHOOP_SLEEP_AND_RECOVERY;
    let id = require_id(I, sleep)?;
    let sleep_start = require_str(I, sleep, &["start"])?;
    let sleep_end = require_str(I, sleep, &["end"])?;
    let effective_date = parse_timestamp(I, "end", sleep_end)?
        .date_naive()
        .format("%Y-%m-%d")
        .to_string();

    let scored = json_str(sleep, &["score_state"]) == Some("SCORED");
    let sleep_score = |field: &str| -> Result<RecordValue, AdapterError> {
        if scored {
            require_f64(I, sleep, &["score", field]).map(numeric)
        } else {
            Ok(RecordValue::Null)
        }
    };

    Ok(Record::new()
        .with("id", id)
        .with("name", effective_date.clone())
        .with("date", effective_date)
        .with("sleep_start_time", sleep_start)
        .with("sleep_end_time", sleep_end)
        .with("sleep_performance_percentage", sleep_score("sleep_performance_percentage")?)
        .with("sleep_consistency_percentage", sleep_score("sleep_consistency_percentage")?)
        .with("sleep_efficiency_percentage", sleep_score("sleep_efficiency_percentage")?)
        .with("recovery_score", numeric(require_f64(I, recovery, &["score", "recovery_score"])?))
        .with(
            "resting_heart_rate",
            numeric(require_f64(I, recovery, &["score", "resting_heart_rate"])?),
        ))
}

pub struct WhoopWorkoutAdapter {
    api: Arc<WhoopApi>,
}

impl WhoopWorkoutAdapter {
    pub fn new(api: Arc<WhoopApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl IntegrationAdapter for WhoopWorkoutAdapter {
    fn integration(&self) -> &'static str {
        WHOOP_WORKOUT
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        window: &DateRange,
    ) -> Result<FetchedRecords, AdapterError> {
        let workouts = self.api.collection("/v1/activity/workout", window).await?;
        let fetched = FetchedRecords::shape(WHOOP_WORKOUT, &workouts, transform_workout);
        info!(
            run_id = %ctx.run_id,
            workouts = fetched.records.len(),
            rejected = fetched.rejected.len(),
            "fetched whoop workouts"
        );
        Ok(fetched)
    }
}

pub struct WhoopSleepRecoveryAdapter {
    api: Arc<WhoopApi>,
}

impl WhoopSleepRecoveryAdapter {
    pub fn new(api: Arc<WhoopApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl IntegrationAdapter for WhoopSleepRecoveryAdapter {
    fn integration(&self) -> &'static str {
        WHOOP_SLEEP_AND_RECOVERY
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        window: &DateRange,
    ) -> Result<FetchedRecords, AdapterError> {
        let sleeps = self.api.collection("/v1/activity/sleep", window).await?;
        let Some(sleep) = sleeps.first() else {
            info!(run_id = %ctx.run_id, window = %window, "no sleep recorded in window");
            return Ok(FetchedRecords::default());
        };
        let recoveries = self.api.collection("/v1/recovery", window).await?;
        let recovery = recoveries.first().ok_or_else(|| AdapterError::MissingField {
            integration: WHOOP_SLEEP_AND_RECOVERY,
            field: "recovery".into(),
        })?;
        Ok(FetchedRecords::shape(
            WHOOP_SLEEP_AND_RECOVERY,
            std::slice::from_ref(sleep),
            |sleep| combine_sleep_and_recovery(sleep, recovery),
        ))
    }
}

pub fn adapter_for_integration(
    integration: &str,
    credentials: &AdapterCredentials,
    http: Arc<HttpClient>,
) -> Result<Option<Box<dyn IntegrationAdapter>>, AdapterError> {
    let whoop_api = || -> Result<Arc<WhoopApi>, AdapterError> {
        let config = credentials
            .whoop
            .clone()
            .ok_or_else(|| AdapterError::MissingCredential {
                integration: integration.to_string(),
                variable: "WHOOP_ACCESS_TOKEN",
            })?;
        Ok(Arc::new(WhoopApi::new(http.clone(), config)))
    };

    match integration {
        LINGQ => {
            let config = credentials
                .lingq
                .clone()
                .ok_or_else(|| AdapterError::MissingCredential {
                    integration: integration.to_string(),
                    variable: "LINGQ_API_KEY",
                })?;
            Ok(Some(Box::new(LingqAdapter::new(http.clone(), config))))
        }
        WHOOP_WORKOUT => Ok(Some(Box::new(WhoopWorkoutAdapter::new(whoop_api()?)))),
        WHOOP_SLEEP_AND_RECOVERY => Ok(Some(Box::new(WhoopSleepRecoveryAdapter::new(whoop_api()?)))),
        _ => Ok(None),
    }
}
