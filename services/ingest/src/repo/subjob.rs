use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};

/// Same shape as `job`, plus `parent_id`.
#[allow(clippy::too_many_arguments)]
pub async fn insert_subjob(
    tx: &mut Transaction<'_, Postgres>,
    subjob_id: &str,
    job_id: &str,
    parent_id: &str,
    app_id: &str,
    site_id: &str,
    sub_key: &str,
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
        r#"INSERT INTO subjob
             (subjob_id, job_id, parent_id, app_id, site_id, sub_key, status,
              started_at, ended_at, duration_s, cpu_user_s, cpu_system_s, mem_max_mb, metadata)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"#,
    )
    .bind(subjob_id)
    .bind(job_id)
    .bind(parent_id)
    .bind(app_id)
    .bind(site_id)
    .bind(sub_key)
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
