//! Postgres persistence for the deal-activity mirror.

use anyhow::Context;
use base64::Engine;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use tracing::info;

pub const CRATE_NAME: &str = "bdam-db";

/// Base64-encoded PEM material for TLS Postgres connections, as supplied by
/// the hosting environment. All three parts are optional; an entirely empty
/// set means plain connection parameters from the URL.
#[derive(Debug, Clone, Default)]
pub struct PgTlsMaterial {
    pub ca_cert_base64: Option<String>,
    pub client_key_base64: Option<String>,
    pub client_cert_base64: Option<String>,
}

impl PgTlsMaterial {
    pub fn is_empty(&self) -> bool {
        self.ca_cert_base64.is_none()
            && self.client_key_base64.is_none()
            && self.client_cert_base64.is_none()
    }
}

/// Build the connection pool. TLS material, when present, switches the
/// connection to full certificate verification.
pub async fn connect(database_url: &str, tls: &PgTlsMaterial) -> anyhow::Result<PgPool> {
    let mut options: PgConnectOptions = database_url.parse().context("parsing DATABASE_URL")?;

    if !tls.is_empty() {
        options = options.ssl_mode(PgSslMode::VerifyFull);
        if let Some(ca) = &tls.ca_cert_base64 {
            options = options.ssl_root_cert_from_pem(decode_pem(ca, "PG_CA_CERT_BASE64")?);
        }
        if let Some(cert) = &tls.client_cert_base64 {
            options = options.ssl_client_cert_from_pem(decode_pem(cert, "PG_CLIENT_CERT_BASE64")?);
        }
        if let Some(key) = &tls.client_key_base64 {
            options = options.ssl_client_key_from_pem(decode_pem(key, "PG_CLIENT_KEY_BASE64")?);
        }
    }

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("connecting to postgres")?;
    Ok(pool)
}

fn decode_pem(encoded: &str, var: &str) -> anyhow::Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .with_context(|| format!("decoding {var}"))
}

/// Boot-time reachability probe; steady-state failures are handled per event.
pub async fn health_check(pool: &PgPool) -> sqlx::Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("running migrations")?;
    info!("database migrations applied");
    Ok(())
}

/// Denormalized snapshot written on every deal ADD/UPDATE; one row per deal.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DealActivityRow {
    pub deal_id: i64,
    pub title: Option<String>,
    pub stage_id: Option<String>,
    pub opportunity_value: Option<f64>,
    pub assigned_by_id: Option<i64>,
    pub created_by_id: Option<i64>,
    pub source_id: Option<String>,
    pub company_id: Option<i64>,
    pub contact_id: Option<i64>,
    pub date_create: Option<DateTime<Utc>>,
    pub date_modify: Option<DateTime<Utc>>,
    pub closed: bool,
    pub priority: bool,
    pub delivery_deadline: Option<String>,
    pub return_type: Option<String>,
    pub demand_type: Option<String>,
    pub executor_code: Option<String>,
    pub executor: Option<String>,
    pub revision_reason: Option<String>,
    pub completion_note: Option<String>,
    pub decline_reason: Option<String>,
}

/// Full-replace upsert keyed on deal id. Last fetched record wins; the CRM is
/// the source of truth and this table is a read mirror.
pub async fn upsert_deal_activity(pool: &PgPool, row: &DealActivityRow) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO deal_activity (
            deal_id, title, stage_id, opportunity_value, assigned_by_id,
            created_by_id, source_id, company_id, contact_id, date_create,
            date_modify, closed, priority, delivery_deadline, return_type,
            demand_type, executor_code, executor, revision_reason,
            completion_note, decline_reason
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
            $12, $13, $14, $15, $16, $17, $18, $19, $20, $21
        )
        ON CONFLICT (deal_id) DO UPDATE SET
            title = EXCLUDED.title,
            stage_id = EXCLUDED.stage_id,
            opportunity_value = EXCLUDED.opportunity_value,
            assigned_by_id = EXCLUDED.assigned_by_id,
            created_by_id = EXCLUDED.created_by_id,
            source_id = EXCLUDED.source_id,
            company_id = EXCLUDED.company_id,
            contact_id = EXCLUDED.contact_id,
            date_create = EXCLUDED.date_create,
            date_modify = EXCLUDED.date_modify,
            closed = EXCLUDED.closed,
            priority = EXCLUDED.priority,
            delivery_deadline = EXCLUDED.delivery_deadline,
            return_type = EXCLUDED.return_type,
            demand_type = EXCLUDED.demand_type,
            executor_code = EXCLUDED.executor_code,
            executor = EXCLUDED.executor,
            revision_reason = EXCLUDED.revision_reason,
            completion_note = EXCLUDED.completion_note,
            decline_reason = EXCLUDED.decline_reason
        "#,
    )
    .bind(row.deal_id)
    .bind(&row.title)
    .bind(&row.stage_id)
    .bind(row.opportunity_value)
    .bind(row.assigned_by_id)
    .bind(row.created_by_id)
    .bind(&row.source_id)
    .bind(row.company_id)
    .bind(row.contact_id)
    .bind(row.date_create)
    .bind(row.date_modify)
    .bind(row.closed)
    .bind(row.priority)
    .bind(&row.delivery_deadline)
    .bind(&row.return_type)
    .bind(&row.demand_type)
    .bind(&row.executor_code)
    .bind(&row.executor)
    .bind(&row.revision_reason)
    .bind(&row.completion_note)
    .bind(&row.decline_reason)
    .execute(pool)
    .await?;
    Ok(())
}

/// Returns the number of rows removed; deleting an absent deal is a no-op.
pub async fn delete_deal_activity(pool: &PgPool, deal_id: i64) -> sqlx::Result<u64> {
    let result = sqlx::query("DELETE FROM deal_activity WHERE deal_id = $1")
        .bind(deal_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn find_company_tag(pool: &PgPool, company_id: i64) -> sqlx::Result<Option<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT tag_prefix FROM companies WHERE bitrix_company_id = $1",
    )
    .bind(company_id)
    .fetch_optional(pool)
    .await
}

/// Plain insert; the primary key is the race boundary for concurrent
/// deliveries of the same company, so a duplicate fails loudly here.
pub async fn insert_company_tag(
    pool: &PgPool,
    company_id: i64,
    company_name: Option<&str>,
    tag_prefix: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO companies (bitrix_company_id, company_name, tag_prefix) VALUES ($1, $2, $3)",
    )
    .bind(company_id)
    .bind(company_name)
    .bind(tag_prefix)
    .execute(pool)
    .await?;
    Ok(())
}

/// Atomic per-company sequence advance; `None` when the company is not cached.
pub async fn next_deal_seq(pool: &PgPool, company_id: i64) -> sqlx::Result<Option<i64>> {
    sqlx::query_scalar::<_, i64>(
        "UPDATE companies SET deal_seq = deal_seq + 1 WHERE bitrix_company_id = $1 RETURNING deal_seq",
    )
    .bind(company_id)
    .fetch_optional(pool)
    .await
}

/// Returns the number of rows removed; absent companies are a no-op.
pub async fn delete_company_tag(pool: &PgPool, company_id: i64) -> sqlx::Result<u64> {
    let result = sqlx::query("DELETE FROM companies WHERE bitrix_company_id = $1")
        .bind(company_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
