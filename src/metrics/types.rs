use crate::error::AppError;
use crate::metrics::poller::PollerState;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_FRESHNESS_WINDOW_MS: u64 = 500;
pub const DEFAULT_INGEST_INTERVAL_MS: u64 = 50;
pub const DEFAULT_LOG_COMPACT_THRESHOLD: usize = 4_096;
pub const DEFAULT_MOCK_MODE: bool = false;
pub const DEFAULT_PERF_TELEMETRY: bool = false;
pub const MIN_POLL_INTERVAL_MS: u64 = 1_000;
pub const MAX_POLL_INTERVAL_MS: u64 = 600_000;
pub const MIN_FRESHNESS_WINDOW_MS: u64 = 50;
pub const MAX_FRESHNESS_WINDOW_MS: u64 = 10_000;
pub const MIN_INGEST_INTERVAL_MS: u64 = 8;
pub const MAX_INGEST_INTERVAL_MS: u64 = 1_000;
pub const MIN_LOG_COMPACT_THRESHOLD: usize = 64;
pub const MAX_LOG_COMPACT_THRESHOLD: usize = 1_048_576;

pub const ENV_SNAPSHOT_URL: &str = "LIVE_METRICS_SNAPSHOT_URL";
pub const ENV_STREAM_URL: &str = "LIVE_METRICS_STREAM_URL";
pub const ENV_POLL_INTERVAL_MS: &str = "LIVE_METRICS_POLL_INTERVAL_MS";
pub const ENV_FRESHNESS_WINDOW_MS: &str = "LIVE_METRICS_FRESHNESS_WINDOW_MS";
pub const ENV_INGEST_INTERVAL_MS: &str = "LIVE_METRICS_INGEST_INTERVAL_MS";
pub const ENV_LOG_COMPACT_THRESHOLD: &str = "LIVE_METRICS_LOG_COMPACT_THRESHOLD";
pub const ENV_MOCK_MODE: &str = "LIVE_METRICS_MOCK_MODE";
pub const ENV_PERF_TELEMETRY: &str = "LIVE_METRICS_PERF_TELEMETRY";

/// Which source last wrote a metric.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricSource {
    Snapshot,
    Stream,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricValue {
    pub name: String,
    pub value: f64,
    pub source: MetricSource,
    /// Stream position of the message that wrote this value. `None` for snapshot writes.
    pub sequence: Option<u64>,
    pub updated_at_ms: i64,
}

impl MetricValue {
    pub fn from_snapshot(name: &str, value: f64, updated_at_ms: i64) -> Self {
        Self {
            name: name.to_string(),
            value,
            source: MetricSource::Snapshot,
            sequence: None,
            updated_at_ms,
        }
    }

    pub fn from_stream(name: &str, value: f64, sequence: u64, updated_at_ms: i64) -> Self {
        Self {
            name: name.to_string(),
            value,
            source: MetricSource::Stream,
            sequence: Some(sequence),
            updated_at_ms,
        }
    }
}

/// Current best-known value per metric name. Entries are only ever replaced whole.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricStateSet {
    entries: BTreeMap<String, MetricValue>,
}

impl MetricStateSet {
    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricValue> {
        self.entries.values()
    }

    pub(crate) fn replace(&mut self, entry: MetricValue) {
        self.entries.insert(entry.name.clone(), entry);
    }

    pub fn merged_values(&self) -> BTreeMap<String, f64> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.value))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    pub sequence: u64,
    pub fields: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FieldValueWire {
    Number(f64),
    Other(IgnoredAny),
}

#[derive(Debug, Deserialize)]
pub struct EventMessageWire {
    pub sequence: u64,
    #[serde(default, alias = "fields")]
    pub data: BTreeMap<String, FieldValueWire>,
}

impl From<EventMessageWire> for EventMessage {
    fn from(value: EventMessageWire) -> Self {
        let total = value.data.len();
        let fields: BTreeMap<String, f64> = value
            .data
            .into_iter()
            .filter_map(|(name, field)| match field {
                FieldValueWire::Number(number) if number.is_finite() && !name.is_empty() => {
                    Some((name, number))
                }
                _ => None,
            })
            .collect();

        let skipped = total - fields.len();
        if skipped > 0 {
            tracing::debug!(
                sequence = value.sequence,
                skipped,
                "dropped non-numeric fields from stream message"
            );
        }

        Self {
            sequence: value.sequence,
            fields,
        }
    }
}

pub fn parse_event_payload(payload: &mut [u8]) -> Result<EventMessage, AppError> {
    let wire: EventMessageWire = simd_json::serde::from_slice(payload)?;
    Ok(wire.into())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotEntry {
    pub name: String,
    pub value: f64,
}

impl SnapshotEntry {
    pub fn new(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SnapshotEntryWire {
    pub name: String,
    pub value: f64,
}

impl TryFrom<SnapshotEntryWire> for SnapshotEntry {
    type Error = AppError;

    fn try_from(value: SnapshotEntryWire) -> Result<Self, Self::Error> {
        let name = value.name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidArgument(
                "snapshot metric name must be non-empty".to_string(),
            ));
        }
        if !value.value.is_finite() {
            return Err(AppError::InvalidArgument(format!(
                "snapshot value for '{name}' must be finite"
            )));
        }

        Ok(Self {
            name: name.to_string(),
            value: value.value,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamConnectionState {
    Connecting,
    Live,
    Reconnecting,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerStatusSnapshot {
    pub state: StreamConnectionState,
    pub poller_state: PollerState,
    pub processed_count: u64,
    pub last_sequence: Option<u64>,
    pub tracked_metrics: u64,
    pub last_snapshot_at_ms: Option<i64>,
    pub snapshot_failures: u64,
    pub reason: Option<String>,
}

impl ReconcilerStatusSnapshot {
    pub fn stopped(reason: Option<String>) -> Self {
        Self {
            state: StreamConnectionState::Stopped,
            poller_state: PollerState::Idle,
            processed_count: 0,
            last_sequence: None,
            tracked_metrics: 0,
            last_snapshot_at_ms: None,
            snapshot_failures: 0,
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartReconcilerArgs {
    pub snapshot_url: Option<String>,
    pub stream_url: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub freshness_window_ms: Option<u64>,
    pub ingest_interval_ms: Option<u64>,
    pub log_compact_threshold: Option<usize>,
    pub mock_mode: Option<bool>,
    pub perf_telemetry: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub snapshot_url: Option<String>,
    pub stream_url: Option<String>,
    pub poll_interval_ms: u64,
    pub freshness_window_ms: u64,
    pub ingest_interval_ms: u64,
    pub log_compact_threshold: usize,
    pub mock_mode: bool,
    pub perf_telemetry: bool,
}

fn normalize_url(
    value: Option<String>,
    label: &str,
    schemes: &[&str],
    required: bool,
) -> Result<Option<String>, AppError> {
    let trimmed = value
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty());

    match trimmed {
        Some(url) => {
            let lowered = url.to_ascii_lowercase();
            if !schemes.iter().any(|scheme| lowered.starts_with(scheme)) {
                return Err(AppError::InvalidArgument(format!(
                    "{label} must start with one of {}",
                    schemes.join(", ")
                )));
            }
            Ok(Some(url))
        }
        None if required => Err(AppError::InvalidArgument(format!(
            "{label} is required unless mockMode is enabled"
        ))),
        None => Ok(None),
    }
}

fn parse_env_bool(key: &str, raw: &str) -> Result<bool, AppError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::InvalidArgument(format!(
            "{key} must be a boolean, got '{raw}'"
        ))),
    }
}

impl StartReconcilerArgs {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Ok(Self {
            snapshot_url: read(ENV_SNAPSHOT_URL),
            stream_url: read(ENV_STREAM_URL),
            poll_interval_ms: read(ENV_POLL_INTERVAL_MS)
                .map(|raw| raw.parse::<u64>())
                .transpose()?,
            freshness_window_ms: read(ENV_FRESHNESS_WINDOW_MS)
                .map(|raw| raw.parse::<u64>())
                .transpose()?,
            ingest_interval_ms: read(ENV_INGEST_INTERVAL_MS)
                .map(|raw| raw.parse::<u64>())
                .transpose()?,
            log_compact_threshold: read(ENV_LOG_COMPACT_THRESHOLD)
                .map(|raw| raw.parse::<usize>())
                .transpose()?,
            mock_mode: read(ENV_MOCK_MODE)
                .map(|raw| parse_env_bool(ENV_MOCK_MODE, &raw))
                .transpose()?,
            perf_telemetry: read(ENV_PERF_TELEMETRY)
                .map(|raw| parse_env_bool(ENV_PERF_TELEMETRY, &raw))
                .transpose()?,
        })
    }

    pub fn normalize(self) -> Result<ReconcilerConfig, AppError> {
        let mock_mode = self.mock_mode.unwrap_or(DEFAULT_MOCK_MODE);
        let snapshot_url = normalize_url(
            self.snapshot_url,
            "snapshotUrl",
            &["http://", "https://"],
            !mock_mode,
        )?;
        let stream_url =
            normalize_url(self.stream_url, "streamUrl", &["ws://", "wss://"], !mock_mode)?;

        let poll_interval_ms = self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&poll_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "pollIntervalMs must be between {MIN_POLL_INTERVAL_MS} and {MAX_POLL_INTERVAL_MS}"
            )));
        }

        let freshness_window_ms = self
            .freshness_window_ms
            .unwrap_or(DEFAULT_FRESHNESS_WINDOW_MS);
        if !(MIN_FRESHNESS_WINDOW_MS..=MAX_FRESHNESS_WINDOW_MS).contains(&freshness_window_ms) {
            return Err(AppError::InvalidArgument(format!(
                "freshnessWindowMs must be between {MIN_FRESHNESS_WINDOW_MS} and {MAX_FRESHNESS_WINDOW_MS}"
            )));
        }

        let ingest_interval_ms = self.ingest_interval_ms.unwrap_or(DEFAULT_INGEST_INTERVAL_MS);
        if !(MIN_INGEST_INTERVAL_MS..=MAX_INGEST_INTERVAL_MS).contains(&ingest_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "ingestIntervalMs must be between {MIN_INGEST_INTERVAL_MS} and {MAX_INGEST_INTERVAL_MS}"
            )));
        }

        let log_compact_threshold = self
            .log_compact_threshold
            .unwrap_or(DEFAULT_LOG_COMPACT_THRESHOLD);
        if !(MIN_LOG_COMPACT_THRESHOLD..=MAX_LOG_COMPACT_THRESHOLD)
            .contains(&log_compact_threshold)
        {
            return Err(AppError::InvalidArgument(format!(
                "logCompactThreshold must be between {MIN_LOG_COMPACT_THRESHOLD} and {MAX_LOG_COMPACT_THRESHOLD}"
            )));
        }

        Ok(ReconcilerConfig {
            snapshot_url,
            stream_url,
            poll_interval_ms,
            freshness_window_ms,
            ingest_interval_ms,
            log_compact_threshold,
            mock_mode,
            perf_telemetry: self.perf_telemetry.unwrap_or(DEFAULT_PERF_TELEMETRY),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerSession {
    pub running: bool,
    pub snapshot_url: Option<String>,
    pub stream_url: Option<String>,
    pub poll_interval_ms: u64,
    pub freshness_window_ms: u64,
    pub ingest_interval_ms: u64,
    pub mock_mode: bool,
    pub perf_telemetry: bool,
}

impl ReconcilerSession {
    pub fn from_config(config: &ReconcilerConfig) -> Self {
        Self {
            running: true,
            snapshot_url: config.snapshot_url.clone(),
            stream_url: config.stream_url.clone(),
            poll_interval_ms: config.poll_interval_ms,
            freshness_window_ms: config.freshness_window_ms,
            ingest_interval_ms: config.ingest_interval_ms,
            mock_mode: config.mock_mode,
            perf_telemetry: config.perf_telemetry,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerStopResult {
    pub stopped: bool,
}
