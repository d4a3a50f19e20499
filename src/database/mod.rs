use std::cmp::Ordering;

use anyhow::{anyhow, Context, Error as ErrReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::{Migrate, MigrateDatabase, Migrator};
use sqlx::pool::PoolOptions;
use sqlx::{Pool, Postgres, Row};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::claims::Claim;
use crate::config::DatabaseConfig;
use crate::session::{SessionData, SessionStatus};
use crate::utils::amount::parse_base_amount;

// Statically link in migration files
static MIGRATOR: Migrator = sqlx::migrate!("schemas/database");

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Internal(#[from] sqlx::Error),
    #[error("malformed claim record for session {session_id}: {source}")]
    MalformedClaim {
        session_id: String,
        source: serde_json::Error,
    },
    #[error("unknown session status {0:?}")]
    UnknownStatus(String),
}

/// Persistence interface of the settlement core. The pipeline and refill
/// controller only touch session storage through this; tests provide an
/// in-memory implementation.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn sessions_by_status(&self, status: SessionStatus) -> Result<Vec<SessionData>, Error>;

    async fn session(&self, id: &str) -> Result<Option<SessionData>, Error>;

    /// Upserts the full session record.
    async fn update_session(&self, session: &SessionData) -> Result<(), Error>;

    /// Replaces only the claim record of a session.
    async fn update_claim_data(&self, session_id: &str, claim: &Claim) -> Result<(), Error>;

    /// Sum of drop amounts committed to live, not-yet-claiming sessions.
    async fn unclaimed_balance(&self) -> Result<u128, Error>;
}

pub struct Database {
    pub pool: Pool<Postgres>,
}

impl Database {
    #[instrument(skip_all)]
    pub async fn new(config: &DatabaseConfig) -> Result<Self, ErrReport> {
        info!("Connecting to database");

        // Create database if requested and does not exist
        if config.migrate && !Postgres::database_exists(&config.database).await? {
            warn!("Database does not exist, creating database");
            Postgres::create_database(&config.database).await?;
        }

        let pool = PoolOptions::<Postgres>::new()
            .max_connections(config.max_connections)
            .connect(&config.database)
            .await
            .context("error connecting to database")?;

        let latest = MIGRATOR
            .migrations
            .last()
            .expect("Missing migrations")
            .version;

        if config.migrate {
            info!("Running migrations");
            MIGRATOR.run(&pool).await?;
        }

        // Validate database schema version
        let mut conn = pool.acquire().await?;

        if conn.dirty_version().await?.is_some() {
            error!(
                expected = latest,
                "Database is in incomplete migration state.",
            );
            return Err(anyhow!("Database is in incomplete migration state."));
        }

        let version = conn
            .list_applied_migrations()
            .await?
            .last()
            .expect("Missing migrations")
            .version;

        match version.cmp(&latest) {
            Ordering::Less => {
                error!(
                    version,
                    expected = latest,
                    "Database is not up to date, try rerunning with database.migrate = true",
                );
                return Err(anyhow!(
                    "Database is not up to date, try rerunning with database.migrate = true"
                ));
            }
            Ordering::Greater => {
                error!(
                    version,
                    latest,
                    "Database version is newer than this version of the software, please update.",
                );
                return Err(anyhow!(
                    "Database version is newer than this version of the software, please update."
                ));
            }
            Ordering::Equal => {
                info!(version, latest, "Database version is up to date.");
            }
        }

        Ok(Self { pool })
    }
}

fn row_to_session(row: &sqlx::postgres::PgRow) -> Result<SessionData, Error> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let claim: Option<String> = row.get("claim");

    let claim = claim
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|source| Error::MalformedClaim {
            session_id: id.clone(),
            source,
        })?;

    Ok(SessionData {
        status: SessionStatus::parse(&status).ok_or(Error::UnknownStatus(status))?,
        target_addr: row.get("target_addr"),
        drop_amount: row.get("drop_amount"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        claim,
        id,
    })
}

fn claim_json(session_id: &str, claim: &Claim) -> Result<String, Error> {
    serde_json::to_string(claim).map_err(|source| Error::MalformedClaim {
        session_id: session_id.to_owned(),
        source,
    })
}

#[async_trait]
impl SessionStore for Database {
    async fn sessions_by_status(&self, status: SessionStatus) -> Result<Vec<SessionData>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, target_addr, drop_amount, created_at, claim
            FROM sessions
            WHERE status = $1
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_session).collect()
    }

    async fn session(&self, id: &str) -> Result<Option<SessionData>, Error> {
        let row = sqlx::query(
            r#"
            SELECT id, status, target_addr, drop_amount, created_at, claim
            FROM sessions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn update_session(&self, session: &SessionData) -> Result<(), Error> {
        let claim = session
            .claim
            .as_ref()
            .map(|claim| claim_json(&session.id, claim))
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO sessions (id, status, target_addr, drop_amount, created_at, claim)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET status = $2, target_addr = $3, drop_amount = $4, claim = $6
            "#,
        )
        .bind(&session.id)
        .bind(session.status.as_str())
        .bind(&session.target_addr)
        .bind(&session.drop_amount)
        .bind(session.created_at)
        .bind(claim)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_claim_data(&self, session_id: &str, claim: &Claim) -> Result<(), Error> {
        let claim = claim_json(session_id, claim)?;

        sqlx::query("UPDATE sessions SET claim = $2 WHERE id = $1")
            .bind(session_id)
            .bind(claim)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn unclaimed_balance(&self) -> Result<u128, Error> {
        let rows = sqlx::query("SELECT id, drop_amount FROM sessions WHERE status = $1")
            .bind(SessionStatus::Claimable.as_str())
            .fetch_all(&self.pool)
            .await?;

        // Summed in integer space; unparsable rows are skipped with a
        // warning rather than failing the whole refill evaluation.
        let mut total: u128 = 0;
        for row in rows {
            let amount: String = row.get("drop_amount");
            match parse_base_amount(&amount) {
                Ok(value) => total = total.saturating_add(value),
                Err(err) => {
                    let id: String = row.get("id");
                    warn!(session = %id, %err, "Skipping session with malformed drop amount");
                }
            }
        }

        Ok(total)
    }
}
