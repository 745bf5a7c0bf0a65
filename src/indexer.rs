use std::str::FromStr;
use std::time::Duration;

use chrono::{ DateTime, Utc };
use serde::{ Deserialize, Deserializer, Serialize, Serializer };

use crate::datasource::DataSourceConnection;
use crate::error::{ PipelineError, ResourceKind, Result };
use crate::schema::IndexSchema;
use crate::skillset::Skillset;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_MAX_FAILED_ITEMS: i32 = 10;
/// `maxFailedItems` value meaning "never fail the run because of bad documents".
pub const UNLIMITED_FAILURES: i32 = -1;

const MIN_INTERVAL: Duration = Duration::from_secs(5 * 60);
const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Periodic run schedule, serialized as an ISO-8601 duration such as `PT2H`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingSchedule {
    #[serde(serialize_with = "serialize_interval", deserialize_with = "deserialize_interval")]
    pub interval: Duration,
}

impl IndexingSchedule {
    pub fn every(interval: Duration) -> Result<Self> {
        if interval < MIN_INTERVAL || interval > MAX_INTERVAL {
            return Err(
                PipelineError::config(
                    format!("indexer interval {:?} must be between 5 minutes and 24 hours", interval)
                )
            );
        }
        Ok(Self { interval })
    }
}

impl Default for IndexingSchedule {
    fn default() -> Self {
        Self { interval: DEFAULT_INTERVAL }
    }
}

/// Renders whole seconds as `PT#H#M#S`, omitting zero parts.
pub fn format_interval(interval: Duration) -> String {
    let total = interval.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut out = String::from("PT");
    if hours > 0 {
        out.push_str(&format!("{}H", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}M", minutes));
    }
    if seconds > 0 || total == 0 {
        out.push_str(&format!("{}S", seconds));
    }
    out
}

/// Parses the subset of ISO-8601 durations the service emits: `P#D` and `PT#H#M#S`.
pub fn parse_interval(text: &str) -> Option<Duration> {
    let rest = text.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };

    let mut seconds = 0u64;
    let mut number = String::new();
    for (part, units) in [
        (date_part, &[('D', 86_400u64)][..]),
        (time_part, &[('H', 3600), ('M', 60), ('S', 1)][..]),
    ] {
        for c in part.chars() {
            if c.is_ascii_digit() {
                number.push(c);
                continue;
            }
            let (_, factor) = units.iter().find(|(unit, _)| *unit == c)?;
            seconds = seconds.checked_add(number.parse::<u64>().ok()?.checked_mul(*factor)?)?;
            number.clear();
        }
        if !number.is_empty() {
            return None;
        }
    }
    Some(Duration::from_secs(seconds))
}

fn serialize_interval<S: Serializer>(interval: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_interval(*interval))
}

fn deserialize_interval<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    let text = String::deserialize(deserializer)?;
    parse_interval(&text).ok_or_else(|| serde::de::Error::custom(format!("invalid interval '{}'", text)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParsingMode {
    Default,
    Json,
    JsonArray,
    JsonLines,
    Text,
}

impl FromStr for ParsingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "default" => Ok(ParsingMode::Default),
            "text" => Ok(ParsingMode::Text),
            "json" => Ok(ParsingMode::Json),
            "jsonArray" => Ok(ParsingMode::JsonArray),
            "jsonLines" => Ok(ParsingMode::JsonLines),
            other => Err(format!("unknown parsing mode '{}'", other)),
        }
    }
}

impl ParsingMode {
    pub fn is_json(self) -> bool {
        matches!(self, ParsingMode::Json | ParsingMode::JsonArray | ParsingMode::JsonLines)
    }
}

/// How blob content is split into documents. `document_root` is a JSON pointer
/// applied to JSON documents before their content is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerConfiguration {
    pub parsing_mode: ParsingMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_root: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexingParameters {
    pub max_failed_items: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<IndexerConfiguration>,
}

impl IndexingParameters {
    pub fn with_max_failed_items(max_failed_items: i32) -> Self {
        Self { max_failed_items, configuration: None }
    }

    /// Whether a run with `failed` bad documents still counts as successful.
    pub fn tolerates(&self, failed: usize) -> bool {
        tolerates(self.max_failed_items, failed)
    }
}

impl Default for IndexingParameters {
    fn default() -> Self {
        Self::with_max_failed_items(DEFAULT_MAX_FAILED_ITEMS)
    }
}

pub fn tolerates(max_failed_items: i32, failed: usize) -> bool {
    max_failed_items == UNLIMITED_FAILURES ||
        (max_failed_items >= 0 && failed <= (max_failed_items as usize))
}

/// Scheduled job binding a data source, a skillset and a target index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Indexer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub data_source_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skillset_name: Option<String>,
    pub target_index_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<IndexingSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<IndexingParameters>,
}

impl Indexer {
    /// Takes the other definitions rather than their names so a binding can only be
    /// built from resources that were defined first.
    pub fn define(
        name: &str,
        skillset: &Skillset,
        index: &IndexSchema,
        data_source: &DataSourceConnection,
        schedule: IndexingSchedule,
        max_failed_items: i32
    ) -> Result<Self> {
        let indexer = Self {
            name: name.to_string(),
            description: Some("Indexer to index documents and generate embeddings".to_string()),
            data_source_name: data_source.name.clone(),
            skillset_name: Some(skillset.name.clone()),
            target_index_name: index.name.clone(),
            schedule: Some(schedule),
            parameters: Some(IndexingParameters::with_max_failed_items(max_failed_items)),
        };
        indexer.validate()?;
        Ok(indexer)
    }

    pub fn with_configuration(mut self, configuration: IndexerConfiguration) -> Self {
        let mut parameters = self.parameters.take().unwrap_or_default();
        parameters.configuration = Some(configuration);
        self.parameters = Some(parameters);
        self
    }

    pub fn configuration(&self) -> Option<&IndexerConfiguration> {
        self.parameters.as_ref().and_then(|p| p.configuration.as_ref())
    }

    /// The service's default when no parameters are sent is zero tolerated failures.
    pub fn max_failed_items(&self) -> i32 {
        self.parameters.as_ref().map_or(0, |p| p.max_failed_items)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| PipelineError::invalid(ResourceKind::Indexer, &self.name, reason);
        if self.name.trim().is_empty() {
            return Err(PipelineError::config("indexer name must not be empty"));
        }
        if self.data_source_name.is_empty() {
            return Err(invalid("no data source bound"));
        }
        if self.target_index_name.is_empty() {
            return Err(invalid("no target index bound"));
        }
        if self.max_failed_items() < UNLIMITED_FAILURES {
            return Err(invalid("maxFailedItems must be -1 or greater"));
        }
        Ok(())
    }
}

/// Overall service health of an indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexerServiceStatus {
    Unknown,
    Error,
    Running,
}

/// Status of a single execution as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionStatus {
    TransientFailure,
    Success,
    InProgress,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    #[serde(default)]
    pub key: Option<String>,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items_processed: usize,
    #[serde(default)]
    pub items_failed: usize,
    #[serde(default)]
    pub errors: Vec<ItemError>,
}

/// Life-cycle position of the most recent run, judged against the failure tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerRunState {
    Created,
    Running,
    Succeeded,
    PartiallySucceeded,
    Failed,
}

impl IndexerRunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IndexerRunState::Succeeded | IndexerRunState::PartiallySucceeded | IndexerRunState::Failed
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, IndexerRunState::Succeeded | IndexerRunState::PartiallySucceeded)
    }

    /// Classifies a finished run purely from its failure count.
    pub fn from_failures(items_failed: usize, max_failed_items: i32) -> Self {
        if !tolerates(max_failed_items, items_failed) {
            IndexerRunState::Failed
        } else if items_failed > 0 {
            IndexerRunState::PartiallySucceeded
        } else {
            IndexerRunState::Succeeded
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerStatus {
    pub status: IndexerServiceStatus,
    #[serde(default)]
    pub last_result: Option<ExecutionResult>,
    #[serde(default)]
    pub execution_history: Vec<ExecutionResult>,
}

impl IndexerStatus {
    pub fn run_state(&self, max_failed_items: i32) -> IndexerRunState {
        let Some(last) = &self.last_result else {
            return IndexerRunState::Created;
        };
        match last.status {
            ExecutionStatus::InProgress => IndexerRunState::Running,
            ExecutionStatus::Reset => IndexerRunState::Created,
            ExecutionStatus::TransientFailure => IndexerRunState::Failed,
            ExecutionStatus::Success => IndexerRunState::from_failures(last.items_failed, max_failed_items),
        }
    }

    /// Identifies the latest execution so a later status can tell whether a newer one began.
    pub fn marker(&self) -> RunMarker {
        RunMarker {
            start_time: self.last_result.as_ref().and_then(|r| r.start_time),
            runs: self.execution_history.len(),
        }
    }

    /// Whether the latest execution started after the one `marker` was taken from.
    pub fn has_run_since(&self, marker: &RunMarker) -> bool {
        let Some(last) = &self.last_result else {
            return false;
        };
        match (last.start_time, marker.start_time) {
            (Some(now), Some(before)) => now > before,
            (Some(_), None) => true,
            (None, _) => self.execution_history.len() > marker.runs,
        }
    }
}

/// Latest execution seen before triggering a run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunMarker {
    pub start_time: Option<DateTime<Utc>>,
    pub runs: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skillset::Skillset;

    fn parts() -> (IndexSchema, DataSourceConnection, Skillset) {
        let index = IndexSchema::define("idx", "https://example-openai.openai.azure.com").unwrap();
        let ds = DataSourceConnection::define("ds", "container", "AccountKey=k").unwrap();
        let ss = Skillset::define("ss", &index, "https://example-openai.openai.azure.com", "k").unwrap();
        (index, ds, ss)
    }

    #[test]
    fn binds_names_of_defined_resources() {
        let (index, ds, ss) = parts();
        let indexer = Indexer::define("idxr", &ss, &index, &ds, IndexingSchedule::default(), 10).unwrap();
        let json = serde_json::to_value(&indexer).unwrap();
        assert_eq!(json["dataSourceName"], "ds");
        assert_eq!(json["skillsetName"], "ss");
        assert_eq!(json["targetIndexName"], "idx");
        assert_eq!(json["schedule"]["interval"], "PT2H");
        assert_eq!(json["parameters"]["maxFailedItems"], 10);
    }

    #[test]
    fn interval_round_trips_through_iso8601() {
        assert_eq!(format_interval(Duration::from_secs(5400)), "PT1H30M");
        assert_eq!(parse_interval("PT2H"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_interval("P1D"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_interval("PT5M"), Some(Duration::from_secs(300)));
        assert_eq!(parse_interval("2H"), None);
        assert_eq!(parse_interval("PT2X"), None);
    }

    #[test]
    fn oversized_intervals_are_rejected() {
        assert_eq!(parse_interval("P99999999999999999D"), None);
        assert_eq!(parse_interval("PT18446744073709551615S"), Some(Duration::from_secs(u64::MAX)));
        assert_eq!(parse_interval("PT18446744073709551615S1M"), None);
        let parsed: std::result::Result<IndexingSchedule, _> =
            serde_json::from_value(serde_json::json!({ "interval": "P99999999999999999D" }));
        assert!(parsed.is_err());
    }

    #[test]
    fn schedule_bounds_are_enforced() {
        assert!(IndexingSchedule::every(Duration::from_secs(60)).is_err());
        assert!(IndexingSchedule::every(Duration::from_secs(25 * 3600)).is_err());
        assert!(IndexingSchedule::every(Duration::from_secs(300)).is_ok());
    }

    #[test]
    fn failure_threshold_decides_success() {
        assert_eq!(IndexerRunState::from_failures(0, 10), IndexerRunState::Succeeded);
        assert_eq!(IndexerRunState::from_failures(10, 10), IndexerRunState::PartiallySucceeded);
        assert_eq!(IndexerRunState::from_failures(11, 10), IndexerRunState::Failed);
        assert_eq!(IndexerRunState::from_failures(1, 0), IndexerRunState::Failed);
        assert_eq!(IndexerRunState::from_failures(10_000, UNLIMITED_FAILURES), IndexerRunState::PartiallySucceeded);
        assert!(IndexingParameters::default().tolerates(10));
        assert!(!IndexingParameters::default().tolerates(11));
    }

    #[test]
    fn status_maps_onto_run_state() {
        let body =
            serde_json::json!({
            "status": "running",
            "lastResult": {
                "status": "success",
                "errorMessage": null,
                "itemsProcessed": 12,
                "itemsFailed": 3,
                "errors": [{ "key": "doc-1", "errorMessage": "could not parse", "statusCode": 400 }]
            },
            "executionHistory": [],
            "limits": { "maxRunTime": "PT2H" }
        });
        let status: IndexerStatus = serde_json::from_value(body).unwrap();
        assert_eq!(status.run_state(10), IndexerRunState::PartiallySucceeded);
        assert_eq!(status.run_state(2), IndexerRunState::Failed);

        let fresh = IndexerStatus {
            status: IndexerServiceStatus::Running,
            last_result: None,
            execution_history: Vec::new(),
        };
        assert_eq!(fresh.run_state(10), IndexerRunState::Created);
        assert!(!fresh.run_state(10).is_terminal());
    }

    fn finished(status: ExecutionStatus, started: &str) -> ExecutionResult {
        ExecutionResult {
            status,
            error_message: None,
            start_time: Some(started.parse().unwrap()),
            end_time: None,
            items_processed: 1,
            items_failed: 0,
            errors: Vec::new(),
        }
    }

    #[test]
    fn newer_execution_is_detected_by_start_time() {
        let old = finished(ExecutionStatus::Success, "2024-05-01T10:00:00Z");
        let before = IndexerStatus {
            status: IndexerServiceStatus::Running,
            last_result: Some(old.clone()),
            execution_history: vec![old.clone()],
        };
        let marker = before.marker();
        assert!(!before.has_run_since(&marker));

        let new = finished(ExecutionStatus::InProgress, "2024-05-01T12:00:00.5Z");
        let after = IndexerStatus {
            status: IndexerServiceStatus::Running,
            last_result: Some(new.clone()),
            execution_history: vec![new, old],
        };
        assert!(after.has_run_since(&marker));
        assert!(!IndexerStatus { last_result: None, ..after }.has_run_since(&RunMarker::default()));
    }

    #[test]
    fn execution_timestamps_parse_from_service_json() {
        let result: ExecutionResult = serde_json::from_value(
            serde_json::json!({
                "status": "success",
                "startTime": "2024-05-01T10:00:00.123Z",
                "endTime": "2024-05-01T10:02:00Z"
            })
        ).unwrap();
        assert!(result.start_time.unwrap() < result.end_time.unwrap());
    }

    #[test]
    fn json_parsing_configuration_is_optional() {
        let (index, ds, ss) = parts();
        let indexer = Indexer::define("idxr", &ss, &index, &ds, IndexingSchedule::default(), 0)
            .unwrap()
            .with_configuration(IndexerConfiguration {
                parsing_mode: ParsingMode::Json,
                document_root: Some("/programs".to_string()),
            });
        let json = serde_json::to_value(&indexer).unwrap();
        assert_eq!(json["parameters"]["configuration"]["parsingMode"], "json");
        assert_eq!(json["parameters"]["configuration"]["documentRoot"], "/programs");
        assert_eq!(indexer.max_failed_items(), 0);
    }

    #[test]
    fn parsing_modes_use_service_spelling() {
        assert_eq!("jsonLines".parse::<ParsingMode>(), Ok(ParsingMode::JsonLines));
        assert_eq!("text".parse::<ParsingMode>(), Ok(ParsingMode::Text));
        assert!("jsonlines".parse::<ParsingMode>().is_err());
        assert!(ParsingMode::JsonArray.is_json());
        assert!(!ParsingMode::Default.is_json());
    }
}
