use sqlx::{Postgres, Transaction};

/// Upsert `app(app_id)` — a no-op on conflict, so the first writer's
/// name/version/site_id wins.
pub async fn upsert_app(
    tx: &mut Transaction<'_, Postgres>,
    app_id: &str,
    name: &str,
    version: &str,
    site_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO app (app_id, name, version, site_id)
           VALUES ($1, $2, $3, $4)
           ON CONFLICT (app_id) DO NOTHING"#,
    )
    .bind(app_id)
    .bind(name)
    .bind(version)
    .bind(site_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
