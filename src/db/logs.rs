//! Append-only per-job log stream.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio_rusqlite::{Connection, params, rusqlite};
use uuid::Uuid;

use crate::core::models::{LogCategory, LogEntry, LogLevel};

pub async fn append(conn: &Connection, entry: LogEntry) -> Result<()> {
    conn.call(move |c| {
        let details = match &entry.details {
            Some(details) => Some(details.to_string()),
            None => None,
        };
        // uuid v7 row ids sort by creation time, which keeps the stream
        // totally ordered even when two entries share a timestamp.
        c.execute(
            "INSERT INTO job_logs (id, job_id, timestamp, level, category, component, message, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Uuid::now_v7().to_string(),
                entry.job_id,
                entry.timestamp.to_rfc3339(),
                entry.level.as_str(),
                entry.category.as_str(),
                entry.component,
                entry.message,
                details,
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

/// Full history for a job, oldest first, optionally filtered to entries at
/// or above `min_level`. The error-only view is `min_level = Error`.
pub async fn for_job(
    conn: &Connection,
    job_id: String,
    min_level: Option<LogLevel>,
    limit: u32,
) -> Result<Vec<LogEntry>> {
    let limit = if limit == 0 { 1000 } else { limit };

    conn.call(move |c| {
        // The level filter must live in the query so LIMIT counts filtered
        // rows; filtering afterwards would drop matching entries whenever
        // the first `limit` rows are mostly below `min_level`.
        let mut sql = String::from(
            "SELECT job_id, timestamp, level, category, component, message, details
             FROM job_logs WHERE job_id = ?1",
        );
        if let Some(min) = min_level {
            let accepted: Vec<String> = ALL_LEVELS
                .iter()
                .filter(|l| **l >= min)
                .map(|l| format!("'{}'", l.as_str()))
                .collect();
            sql.push_str(&format!(" AND level IN ({})", accepted.join(", ")));
        }
        sql.push_str(" ORDER BY id ASC LIMIT ?2");

        let mut stmt = c.prepare(&sql)?;
        let entries = stmt
            .query_map(params![job_id, limit], row_to_entry)?
            .collect::<rusqlite::Result<Vec<LogEntry>>>()?;
        Ok::<Vec<LogEntry>, rusqlite::Error>(entries)
    })
    .await
    .map_err(|e| anyhow!("Failed to get job logs: {}", e))
}

const ALL_LEVELS: [LogLevel; 5] = [
    LogLevel::Debug,
    LogLevel::Info,
    LogLevel::Warning,
    LogLevel::Error,
    LogLevel::Critical,
];

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
    let level_text: String = row.get(2)?;
    let category_text: String = row.get(3)?;
    let details: Option<serde_json::Value> = match row.get::<_, Option<String>>(6)? {
        Some(raw) => serde_json::from_str(&raw).ok(),
        None => None,
    };

    Ok(LogEntry {
        job_id: row.get(0)?,
        timestamp: row
            .get::<_, String>(1)?
            .parse::<DateTime<Utc>>()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    format!("{e}").into(),
                )
            })?,
        level: LogLevel::parse(&level_text).unwrap_or(LogLevel::Info),
        category: parse_category(&category_text),
        component: row.get(4)?,
        message: row.get(5)?,
        details,
    })
}

fn parse_category(s: &str) -> LogCategory {
    match s {
        "SYSTEM" => LogCategory::System,
        "IMAGE" => LogCategory::Image,
        "DRIVER" => LogCategory::Driver,
        "UPDATE" => LogCategory::Update,
        "WORKFLOW" => LogCategory::Workflow,
        _ => LogCategory::Job,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{BuildOptions, BuildRequest, Job};

    async fn store() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = crate::db::init(&dir.path().join("wipd.db")).await.unwrap();
        (dir, conn)
    }

    // Log rows reference a job row, so every test stream needs a parent.
    async fn seeded_job(conn: &Connection) -> String {
        let job = Job::new(&BuildRequest {
            device: "ws-100".to_string(),
            os_id: 10,
            options: BuildOptions::default(),
        });
        let id = job.id.clone();
        crate::db::jobs::create(conn, job).await.unwrap();
        id
    }

    fn entry(job_id: &str, level: LogLevel, message: &str) -> LogEntry {
        LogEntry::new(job_id, level, LogCategory::Job, "test", message)
    }

    #[tokio::test]
    async fn level_filter_applies_before_the_row_limit() {
        let (_dir, conn) = store().await;
        let job_id = seeded_job(&conn).await;

        // An error buried past the limit must still surface in the
        // error-only view.
        for i in 0..5 {
            append(&conn, entry(&job_id, LogLevel::Info, &format!("info {i}")))
                .await
                .unwrap();
        }
        append(&conn, entry(&job_id, LogLevel::Error, "something broke"))
            .await
            .unwrap();

        let errors = for_job(&conn, job_id, Some(LogLevel::Error), 5)
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "something broke");
        assert_eq!(errors[0].level, LogLevel::Error);
    }

    #[tokio::test]
    async fn min_level_keeps_everything_at_or_above() {
        let (_dir, conn) = store().await;
        let job_id = seeded_job(&conn).await;
        let other_id = seeded_job(&conn).await;

        append(&conn, entry(&job_id, LogLevel::Debug, "noise")).await.unwrap();
        append(&conn, entry(&job_id, LogLevel::Warning, "heads up")).await.unwrap();
        append(&conn, entry(&job_id, LogLevel::Critical, "on fire")).await.unwrap();
        append(&conn, entry(&other_id, LogLevel::Error, "other job")).await.unwrap();

        let filtered = for_job(&conn, job_id.clone(), Some(LogLevel::Warning), 0)
            .await
            .unwrap();
        let messages: Vec<&str> = filtered.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["heads up", "on fire"]);

        let all = for_job(&conn, job_id, None, 0).await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
