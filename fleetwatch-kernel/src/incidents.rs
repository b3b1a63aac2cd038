//! Persisted incident log
//!
//! One JSON file per UTC calendar day, `log<YYYY-MM-DD>.json`:
//!
//! ```json
//! { "api_errors": { "502": ["2026-01-01T10:00:00Z"] },
//!   "incidents":  { "base1": [ { "fault_code": "1412", ... } ] } }
//! ```
//!
//! Every write is a whole-file read-modify-write, serialized through one async
//! mutex and landed with a temp-file rename. A day file that no longer parses
//! is left alone and that day's writes go to `fallbackLog.json` instead.

use crate::models::{FaultIncident, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, Date, OffsetDateTime};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error};

pub const FALLBACK_FILE: &str = "fallbackLog.json";

#[derive(Debug, Error)]
pub enum IncidentLogError {
    #[error("incident log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("incident log is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Content of one day file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentLog {
    /// Upstream HTTP status -> RFC 3339 time of each occurrence
    #[serde(default)]
    pub api_errors: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub incidents: BTreeMap<UnitId, Vec<FaultIncident>>,
}

impl IncidentLog {
    fn with_units(unit_ids: &[UnitId]) -> Self {
        let mut log = Self::default();
        log.ensure_units(unit_ids);
        log
    }

    fn ensure_units(&mut self, unit_ids: &[UnitId]) {
        for id in unit_ids {
            self.incidents.entry(id.clone()).or_default();
        }
    }

    pub fn incidents_for(&self, unit_id: &str) -> &[FaultIncident] {
        self.incidents.get(unit_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn api_error_count(&self, status: u16) -> usize {
        self.api_errors
            .get(&status.to_string())
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn total_incidents(&self) -> usize {
        self.incidents.values().map(Vec::len).sum()
    }
}

pub struct IncidentStore {
    log_dir: PathBuf,
    unit_ids: Vec<UnitId>,
    write_lock: Mutex<()>,
}

impl IncidentStore {
    pub fn new(log_dir: impl Into<PathBuf>, unit_ids: Vec<UnitId>) -> Self {
        Self {
            log_dir: log_dir.into(),
            unit_ids,
            write_lock: Mutex::new(()),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn day_path(&self, date: Date) -> PathBuf {
        self.log_dir.join(format!("log{}.json", date))
    }

    pub fn fallback_path(&self) -> PathBuf {
        self.log_dir.join(FALLBACK_FILE)
    }

    /// Reads one day. A missing file yields an empty, unit-populated log.
    pub async fn load_day(&self, date: Date) -> Result<IncidentLog, IncidentLogError> {
        let mut log = read_log(&self.day_path(date))
            .await?
            .unwrap_or_default();
        log.ensure_units(&self.unit_ids);
        Ok(log)
    }

    pub async fn load_fallback(&self) -> Result<Option<IncidentLog>, IncidentLogError> {
        read_log(&self.fallback_path()).await
    }

    /// Appends to today's file.
    pub async fn append(
        &self,
        unit_id: &str,
        incidents: &[FaultIncident],
    ) -> Result<(), IncidentLogError> {
        self.append_on(today(), unit_id, incidents).await
    }

    pub async fn append_on(
        &self,
        date: Date,
        unit_id: &str,
        incidents: &[FaultIncident],
    ) -> Result<(), IncidentLogError> {
        if incidents.is_empty() {
            return Ok(());
        }
        let unit_id = unit_id.to_string();
        self.update(date, move |log| {
            log.incidents
                .entry(unit_id)
                .or_default()
                .extend_from_slice(incidents);
        })
        .await
    }

    /// Counts one upstream API error under its HTTP status.
    pub async fn record_api_error(&self, status: u16) -> Result<(), IncidentLogError> {
        let now = OffsetDateTime::now_utc();
        let stamp = now.format(&Rfc3339).unwrap_or_else(|_| now.unix_timestamp().to_string());
        self.update(now.date(), move |log| {
            log.api_errors
                .entry(status.to_string())
                .or_default()
                .push(stamp);
        })
        .await
    }

    async fn update<F>(&self, date: Date, apply: F) -> Result<(), IncidentLogError>
    where
        F: FnOnce(&mut IncidentLog),
    {
        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.log_dir).await?;

        let day_path = self.day_path(date);
        let (target, mut log) = match read_log(&day_path).await {
            Ok(Some(log)) => (day_path, log),
            Ok(None) => (day_path, IncidentLog::with_units(&self.unit_ids)),
            Err(IncidentLogError::Json(e)) => {
                error!(path = %day_path.display(), error = %e, "corrupt incident log, writing to fallback");
                let fallback = self.fallback_path();
                let log = match read_log(&fallback).await {
                    Ok(existing) => existing.unwrap_or_default(),
                    Err(IncidentLogError::Json(e)) => {
                        error!(path = %fallback.display(), error = %e, "fallback log corrupt, starting over");
                        IncidentLog::default()
                    }
                    Err(e) => return Err(e),
                };
                (fallback, log)
            }
            Err(e) => return Err(e),
        };

        log.ensure_units(&self.unit_ids);
        apply(&mut log);
        write_atomic(&target, &log).await?;
        debug!(path = %target.display(), "incident log written");
        Ok(())
    }
}

pub fn today() -> Date {
    OffsetDateTime::now_utc().date()
}

async fn read_log(path: &Path) -> Result<Option<IncidentLog>, IncidentLogError> {
    match fs::read_to_string(path).await {
        Ok(text) if text.trim().is_empty() => Ok(None),
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_atomic(path: &Path, log: &IncidentLog) -> Result<(), IncidentLogError> {
    let json = serde_json::to_string_pretty(log)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FaultOutcome;
    use tempfile::TempDir;
    use time::macros::date;

    fn store(dir: &TempDir) -> IncidentStore {
        IncidentStore::new(dir.path(), vec!["base1".to_string(), "base2".to_string()])
    }

    #[test]
    fn test_day_path_layout() {
        let store = IncidentStore::new("/var/log/fleet", vec![]);
        assert_eq!(
            store.day_path(date!(2024 - 03 - 07)),
            PathBuf::from("/var/log/fleet/log2024-03-07.json")
        );
    }

    #[tokio::test]
    async fn test_missing_day_is_populated_for_every_unit() {
        let dir = TempDir::new().unwrap();
        let log = store(&dir).load_day(date!(2024 - 03 - 07)).await.unwrap();
        assert_eq!(log.incidents.len(), 2);
        assert_eq!(log.total_incidents(), 0);
    }

    #[tokio::test]
    async fn test_appends_accumulate_in_order() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let day = date!(2024 - 03 - 07);

        let first = FaultIncident::new("base1", "1412", FaultOutcome::AutoReleased);
        let second = FaultIncident::new("base1", "1416", FaultOutcome::NotReleased);
        store.append_on(day, "base1", &[first.clone()]).await.unwrap();
        store.append_on(day, "base1", &[second.clone()]).await.unwrap();

        let log = store.load_day(day).await.unwrap();
        assert_eq!(log.incidents_for("base1"), &[first, second]);
        assert!(log.incidents_for("base2").is_empty());
        assert!(!store.day_path(day).with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_api_errors_are_counted_per_status() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.record_api_error(502).await.unwrap();
        store.record_api_error(502).await.unwrap();

        let log = store.load_day(today()).await.unwrap();
        assert_eq!(log.api_error_count(502), 2);
        assert_eq!(log.api_error_count(503), 0);
    }

    #[tokio::test]
    async fn test_corrupt_day_redirects_to_fallback() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let day = date!(2024 - 03 - 07);
        std::fs::write(store.day_path(day), "{ not json").unwrap();

        let incident = FaultIncident::new("base2", "1201", FaultOutcome::AutoReleased);
        store.append_on(day, "base2", &[incident.clone()]).await.unwrap();

        assert_eq!(std::fs::read_to_string(store.day_path(day)).unwrap(), "{ not json");
        let fallback = store.load_fallback().await.unwrap().unwrap();
        assert_eq!(fallback.incidents_for("base2"), &[incident]);
        assert!(matches!(
            store.load_day(day).await,
            Err(IncidentLogError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_lose_records() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(store(&dir));
        let day = date!(2024 - 03 - 07);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let code = format!("{}", 1400 + i);
                let incident = FaultIncident::new("base1", &code, FaultOutcome::NotReleased);
                store.append_on(day, "base1", &[incident]).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let log = store.load_day(day).await.unwrap();
        assert_eq!(log.incidents_for("base1").len(), 8);
    }
}
