use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::browser::BrowserError;
use crate::config::ScoutConfig;

pub type TelemetryResult<T> = Result<T, TelemetryError>;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("telemetry database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("telemetry serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Navigation,
    Timeout,
    RateLimit,
    Script,
    Action,
    Io,
    Other,
}

pub fn categorize(error: &BrowserError) -> ErrorCategory {
    if error.is_rate_limit() {
        return ErrorCategory::RateLimit;
    }
    match error {
        BrowserError::Navigation { .. } => ErrorCategory::Navigation,
        BrowserError::Timeout(_) => ErrorCategory::Timeout,
        BrowserError::Script(_) => ErrorCategory::Script,
        BrowserError::Action(_) | BrowserError::ElementNotFound(_) => ErrorCategory::Action,
        BrowserError::Io(_) => ErrorCategory::Io,
        _ => ErrorCategory::Other,
    }
}

#[derive(Debug, Serialize)]
struct FailureRecord<'a> {
    ts: String,
    url: &'a str,
    phase: &'a str,
    category: ErrorCategory,
    message: String,
    attempt: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySummary {
    pub pages_ok: u64,
    pub pages_failed: u64,
    pub failures: u64,
    pub rate_limit_events: u64,
    pub average_score: Option<f64>,
}

/// Run telemetry: failures go to an append-only JSONL log for quick
/// grepping, everything goes into sqlite for aggregation.
pub struct CrawlTelemetry {
    failure_log: PathBuf,
    conn: Mutex<Connection>,
}

impl CrawlTelemetry {
    pub fn open(config: &ScoutConfig) -> TelemetryResult<Self> {
        let failure_log = config.resolve_path(&config.observability.failure_log);
        let db_path = config.resolve_path(&config.observability.metrics_db);
        for path in [&failure_log, &db_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS crawl_pages (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 ts TEXT NOT NULL,
                 url TEXT NOT NULL,
                 success INTEGER NOT NULL,
                 duration_ms INTEGER NOT NULL,
                 score REAL,
                 screenshot_path TEXT
             );
             CREATE TABLE IF NOT EXISTS crawl_failures (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 ts TEXT NOT NULL,
                 url TEXT NOT NULL,
                 phase TEXT NOT NULL,
                 category TEXT NOT NULL,
                 error_message TEXT NOT NULL,
                 attempt INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS rate_limit_events (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 ts TEXT NOT NULL,
                 cooldown_seconds INTEGER NOT NULL,
                 concurrency INTEGER NOT NULL
             );",
        )?;
        Ok(Self {
            failure_log,
            conn: Mutex::new(conn),
        })
    }

    pub fn record_page(
        &self,
        url: &str,
        success: bool,
        duration_ms: u64,
        score: Option<f64>,
        screenshot_path: Option<&str>,
    ) -> TelemetryResult<()> {
        let conn = self.conn.lock().expect("telemetry mutex poisoned");
        conn.execute(
            "INSERT INTO crawl_pages (ts, url, success, duration_ms, score, screenshot_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Utc::now().to_rfc3339(),
                url,
                success as i64,
                duration_ms as i64,
                score,
                screenshot_path,
            ],
        )?;
        Ok(())
    }

    pub fn record_failure(
        &self,
        url: &str,
        phase: &str,
        error: &BrowserError,
        attempt: u32,
    ) -> TelemetryResult<()> {
        let category = categorize(error);
        let record = FailureRecord {
            ts: Utc::now().to_rfc3339(),
            url,
            phase,
            category,
            message: error.to_string(),
            attempt,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.failure_log)?
            .write_all(line.as_bytes())?;

        let conn = self.conn.lock().expect("telemetry mutex poisoned");
        conn.execute(
            "INSERT INTO crawl_failures (ts, url, phase, category, error_message, attempt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.ts,
                url,
                phase,
                serde_json::to_string(&category)?.trim_matches('"'),
                record.message,
                attempt,
            ],
        )?;
        Ok(())
    }

    pub fn record_rate_limit(&self, cooldown_seconds: u64, concurrency: usize) -> TelemetryResult<()> {
        let conn = self.conn.lock().expect("telemetry mutex poisoned");
        conn.execute(
            "INSERT INTO rate_limit_events (ts, cooldown_seconds, concurrency)
             VALUES (?1, ?2, ?3)",
            params![
                Utc::now().to_rfc3339(),
                cooldown_seconds as i64,
                concurrency as i64,
            ],
        )?;
        Ok(())
    }

    /// URLs whose most recent crawl succeeded with a score above
    /// `min_score` (unscored successes count as healthy). Resume keeps
    /// these settled and releases everything else for another pass.
    pub fn healthy_urls(&self, min_score: f64) -> TelemetryResult<HashSet<String>> {
        let conn = self.conn.lock().expect("telemetry mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT url FROM crawl_pages
             WHERE id IN (SELECT MAX(id) FROM crawl_pages GROUP BY url)
               AND success = 1
               AND (score IS NULL OR score > ?1)",
        )?;
        let rows = stmt.query_map(params![min_score], |row| row.get::<_, String>(0))?;
        let mut urls = HashSet::new();
        for url in rows {
            urls.insert(url?);
        }
        Ok(urls)
    }

    pub fn summary(&self) -> TelemetryResult<TelemetrySummary> {
        let conn = self.conn.lock().expect("telemetry mutex poisoned");
        let pages_ok: u64 =
            conn.query_row("SELECT COUNT(*) FROM crawl_pages WHERE success = 1", [], |row| {
                row.get(0)
            })?;
        let pages_failed: u64 =
            conn.query_row("SELECT COUNT(*) FROM crawl_pages WHERE success = 0", [], |row| {
                row.get(0)
            })?;
        let failures: u64 =
            conn.query_row("SELECT COUNT(*) FROM crawl_failures", [], |row| row.get(0))?;
        let rate_limit_events: u64 =
            conn.query_row("SELECT COUNT(*) FROM rate_limit_events", [], |row| row.get(0))?;
        let average_score: Option<f64> = conn.query_row(
            "SELECT AVG(score) FROM crawl_pages WHERE score IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(TelemetrySummary {
            pages_ok,
            pages_failed,
            failures,
            rate_limit_events,
            average_score,
        })
    }
}

/// Best-effort wrapper: telemetry must never take the crawl down.
pub fn record_or_warn<T>(result: TelemetryResult<T>) {
    if let Err(err) = result {
        warn!(error = %err, "telemetry write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn telemetry(dir: &TempDir) -> CrawlTelemetry {
        let mut config = ScoutConfig::for_url("https://x.com/app");
        config.artifacts.base_dir = dir.path().display().to_string();
        CrawlTelemetry::open(&config).unwrap()
    }

    #[test]
    fn pages_and_failures_show_up_in_summary() {
        let dir = TempDir::new().unwrap();
        let telemetry = telemetry(&dir);

        telemetry
            .record_page("https://x.com/app/a", true, 1200, Some(88.0), None)
            .unwrap();
        telemetry
            .record_page("https://x.com/app/b", false, 400, None, None)
            .unwrap();
        telemetry
            .record_failure(
                "https://x.com/app/b",
                "stabilization",
                &BrowserError::Timeout("content".into()),
                1,
            )
            .unwrap();
        telemetry.record_rate_limit(60, 2).unwrap();

        let summary = telemetry.summary().unwrap();
        assert_eq!(summary.pages_ok, 1);
        assert_eq!(summary.pages_failed, 1);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.rate_limit_events, 1);
        assert_eq!(summary.average_score, Some(88.0));
    }

    #[test]
    fn healthy_urls_follow_the_latest_verdict_per_page() {
        let dir = TempDir::new().unwrap();
        let telemetry = telemetry(&dir);

        telemetry
            .record_page("https://x.com/app/a", true, 1000, Some(85.0), None)
            .unwrap();
        // Recovered after an earlier failure: latest row wins.
        telemetry
            .record_page("https://x.com/app/b", false, 300, None, None)
            .unwrap();
        telemetry
            .record_page("https://x.com/app/b", true, 900, Some(70.0), None)
            .unwrap();
        telemetry
            .record_page("https://x.com/app/c", false, 200, None, None)
            .unwrap();
        // Completed but scored like an error page.
        telemetry
            .record_page("https://x.com/app/d", true, 800, Some(12.0), None)
            .unwrap();

        let healthy = telemetry.healthy_urls(20.0).unwrap();
        assert!(healthy.contains("https://x.com/app/a"));
        assert!(healthy.contains("https://x.com/app/b"));
        assert!(!healthy.contains("https://x.com/app/c"));
        assert!(!healthy.contains("https://x.com/app/d"));
    }

    #[test]
    fn failures_are_appended_as_jsonl() {
        let dir = TempDir::new().unwrap();
        let telemetry = telemetry(&dir);
        telemetry
            .record_failure(
                "https://x.com/app",
                "navigation",
                &BrowserError::RateLimited("429".into()),
                0,
            )
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join("artifacts/failures.log")).unwrap();
        let record: serde_json::Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        assert_eq!(record["category"], "rate_limit");
        assert_eq!(record["phase"], "navigation");
    }

    #[test]
    fn category_mapping_is_stable() {
        assert_eq!(
            categorize(&BrowserError::RateLimited("429".into())),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            categorize(&BrowserError::ElementNotFound("#x".into())),
            ErrorCategory::Action
        );
        assert_eq!(
            categorize(&BrowserError::Timeout("landmark".into())),
            ErrorCategory::Timeout
        );
    }
}
