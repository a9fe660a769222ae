use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};

/// Job rows are append-only; readers pick the latest by `inserted_at`.
#[allow(clippy::too_many_arguments)]
pub async fn insert_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: &str,
    app_id: &str,
    site_id: &str,
    job_key: &str,
    status: &str,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    duration_s: Option<f64>,
    cpu_user_s: Option<f64>,
    cpu_system_s: Option<f64>,
    mem_max_mb: Option<f64>,
    metadata: Option<&serde_json::Value>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO job
             (job_id, app_id, site_id, job_key, status, started_at, ended_at,
              duration_s, cpu_user_s, cpu_system_s, mem_max_mb, metadata)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
    )
    .bind(job_id)
    .bind(app_id)
    .bind(site_id)
    .bind(job_key)
    .bind(status)
    .bind(started_at)
    .bind(ended_at)
    .bind(duration_s)
    .bind(cpu_user_s)
    .bind(cpu_system_s)
    .bind(mem_max_mb)
    .bind(metadata)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
