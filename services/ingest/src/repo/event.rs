use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

/// Outcome of inserting the `event` row, which is the idempotency
/// primitive: a duplicate `idempotency_key` is silently discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventInsertOutcome {
    Inserted,
    DuplicateIgnored,
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    at: DateTime<Utc>,
    entity_type: Option<&str>,
    entity_id: Option<&str>,
    app_id: &str,
    site_id: &str,
    kind: &str,
    payload: &serde_json::Value,
    idempotency_key: Uuid,
) -> Result<EventInsertOutcome, sqlx::Error> {
    let row = sqlx::query(
        r#"INSERT INTO event (at, entity_type, entity_id, app_id, site_id, kind, payload, idempotency_key)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
           ON CONFLICT (idempotency_key) DO NOTHING
           RETURNING id"#,
    )
    .bind(at)
    .bind(entity_type)
    .bind(entity_id)
    .bind(app_id)
    .bind(site_id)
    .bind(kind)
    .bind(payload)
    .bind(idempotency_key)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(if row.is_some() {
        EventInsertOutcome::Inserted
    } else {
        EventInsertOutcome::DuplicateIgnored
    })
}

pub async fn count_by_idempotency_key(
    pool: &sqlx::PgPool,
    idempotency_key: Uuid,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT count(*) AS n FROM event WHERE idempotency_key = $1")
        .bind(idempotency_key)
        .fetch_one(pool)
        .await?;
    Ok(row.get("n"))
}
