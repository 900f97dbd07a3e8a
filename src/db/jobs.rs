//! Durable job records.
//!
//! Writes are full-row and last-write-wins; the single-worker-per-job rule
//! means only one writer ever touches a running job's row.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use tokio_rusqlite::{Connection, params, rusqlite};

use crate::core::models::{BuildResults, Job, JobStatus};

pub async fn create(conn: &Connection, job: Job) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "INSERT INTO jobs (
                id, device, os_id, status, progress, current_step,
                step_number, total_steps, skip_drivers, skip_updates,
                skip_validation, created_at, started_at, completed_at,
                error, results
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            job_params(&job)?,
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn update(conn: &Connection, job: Job) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "UPDATE jobs SET
                device = ?2, os_id = ?3, status = ?4, progress = ?5,
                current_step = ?6, step_number = ?7, total_steps = ?8,
                skip_drivers = ?9, skip_updates = ?10, skip_validation = ?11,
                created_at = ?12, started_at = ?13, completed_at = ?14,
                error = ?15, results = ?16
             WHERE id = ?1",
            job_params(&job)?,
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn get(conn: &Connection, job_id: String) -> Result<Option<Job>> {
    conn.call(move |c| {
        use rusqlite::OptionalExtension;
        let mut stmt = c.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"
        ))?;
        stmt.query_row(params![job_id], row_to_job).optional()
    })
    .await
    .map_err(|e| anyhow!("Failed to get job: {}", e))
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: u32,
    pub offset: u32,
}

pub async fn list(conn: &Connection, filter: JobFilter) -> Result<Vec<Job>> {
    let limit = if filter.limit == 0 { 50 } else { filter.limit };

    conn.call(move |c| {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        if filter.status.is_some() {
            sql.push_str(" WHERE status = ?3");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?1 OFFSET ?2");

        let mut stmt = c.prepare(&sql)?;
        let jobs = match filter.status {
            Some(status) => stmt
                .query_map(params![limit, filter.offset, status.as_str()], row_to_job)?
                .collect::<rusqlite::Result<Vec<Job>>>()?,
            None => stmt
                .query_map(params![limit, filter.offset], row_to_job)?
                .collect::<rusqlite::Result<Vec<Job>>>()?,
        };
        Ok::<Vec<Job>, rusqlite::Error>(jobs)
    })
    .await
    .map_err(|e| anyhow!("Failed to list jobs: {}", e))
}

/// Jobs left non-terminal by a previous process are unfinishable; mark them
/// failed before the queue opens so readers never see a phantom `running`.
pub async fn mark_interrupted(conn: &Connection) -> Result<usize> {
    let now = Utc::now().to_rfc3339();
    let count = conn
        .call(move |c| {
            c.execute(
                "UPDATE jobs SET status = 'failed',
                    error = 'interrupted by daemon restart',
                    completed_at = ?1
                 WHERE status IN ('created', 'running')",
                params![now],
            )
        })
        .await?;

    Ok(count)
}

/// Age-based retention purge. Administrative operation only, never invoked
/// by the pipeline; job logs go with their job via cascade.
pub async fn purge_older_than(conn: &Connection, days: u32) -> Result<usize> {
    let cutoff = (Utc::now() - Duration::days(days as i64)).to_rfc3339();
    let count = conn
        .call(move |c| {
            c.execute(
                "DELETE FROM jobs WHERE created_at < ?1 AND status IN ('completed', 'failed', 'cancelled')",
                params![cutoff],
            )
        })
        .await?;

    Ok(count)
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub job_count: u64,
    pub log_count: u64,
}

pub async fn stats(conn: &Connection) -> Result<StoreStats> {
    conn.call(|c| {
        let job_count: u64 = c.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?;
        let log_count: u64 = c.query_row("SELECT COUNT(*) FROM job_logs", [], |r| r.get(0))?;
        Ok::<StoreStats, rusqlite::Error>(StoreStats {
            job_count,
            log_count,
        })
    })
    .await
    .map_err(|e| anyhow!("Failed to read store stats: {}", e))
}

const JOB_COLUMNS: &str = "id, device, os_id, status, progress, current_step, step_number, \
     total_steps, skip_drivers, skip_updates, skip_validation, created_at, \
     started_at, completed_at, error, results";

fn job_params(job: &Job) -> rusqlite::Result<[rusqlite::types::Value; 16]> {
    use rusqlite::types::Value;

    let results = match &job.results {
        Some(results) => Value::Text(
            serde_json::to_string(results).map_err(|e| conversion_error(15, e))?,
        ),
        None => Value::Null,
    };

    Ok([
        Value::Text(job.id.clone()),
        Value::Text(job.device.clone()),
        Value::Integer(job.os_id as i64),
        Value::Text(job.status.as_str().to_string()),
        Value::Integer(job.progress as i64),
        Value::Text(job.current_step.clone()),
        Value::Integer(job.step_number as i64),
        Value::Integer(job.total_steps as i64),
        Value::Integer(job.options.skip_drivers as i64),
        Value::Integer(job.options.skip_updates as i64),
        Value::Integer(job.options.skip_validation as i64),
        Value::Text(job.created_at.to_rfc3339()),
        optional_ts(job.started_at),
        optional_ts(job.completed_at),
        match &job.error {
            Some(e) => Value::Text(e.clone()),
            None => Value::Null,
        },
        results,
    ])
}

fn optional_ts(ts: Option<DateTime<Utc>>) -> rusqlite::types::Value {
    match ts {
        Some(ts) => rusqlite::types::Value::Text(ts.to_rfc3339()),
        None => rusqlite::types::Value::Null,
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let status_text: String = row.get(3)?;
    let status = JobStatus::parse(&status_text)
        .ok_or_else(|| conversion_error(3, format!("unknown status '{status_text}'")))?;

    let results: Option<BuildResults> = match row.get::<_, Option<String>>(15)? {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| conversion_error(15, e))?),
        None => None,
    };

    Ok(Job {
        id: row.get(0)?,
        device: row.get(1)?,
        os_id: row.get::<_, i64>(2)? as u32,
        status,
        progress: row.get::<_, i64>(4)? as u8,
        current_step: row.get(5)?,
        step_number: row.get::<_, i64>(6)? as u32,
        total_steps: row.get::<_, i64>(7)? as u32,
        options: crate::core::models::BuildOptions {
            skip_drivers: row.get(8)?,
            skip_updates: row.get(9)?,
            skip_validation: row.get(10)?,
        },
        created_at: parse_ts(row.get(11)?, 11)?,
        started_at: parse_optional_ts(row.get(12)?, 12)?,
        completed_at: parse_optional_ts(row.get(13)?, 13)?,
        error: row.get(14)?,
        results,
    })
}

fn parse_ts(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| conversion_error(column, e))
}

fn parse_optional_ts(
    raw: Option<String>,
    column: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_ts(r, column)).transpose()
}

fn conversion_error(
    column: usize,
    err: impl std::fmt::Display,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        format!("{err}").into(),
    )
}
