// 🗄️ SQLite storage - Schema, batch unit of work, run log
//
// Clients and places are deduplicated by natural key with INSERT OR IGNORE,
// so two writers racing on the same new client both succeed. Transactions are
// upserted by their derived id, which makes redelivering a batch harmless.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::entities::{Client, Place, Transaction};
use crate::error::IngestError;
use crate::gateway::{NaturalKeyCache, PersistenceGateway};
use crate::pipeline::RunSummary;

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery; in-memory databases answer "memory"
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS clients (
            inn TEXT PRIMARY KEY NOT NULL,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            middle_name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS places (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            place TEXT UNIQUE NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY NOT NULL,
            amount TEXT NOT NULL,
            currency TEXT NOT NULL,
            card TEXT NOT NULL,
            client_inn TEXT NOT NULL REFERENCES clients(inn),
            place_id INTEGER NOT NULL REFERENCES places(id)
        )",
        [],
    )?;

    // ==========================================================================
    // Run log (one row per pipeline run, forced stops included)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS load_runs (
            run_id TEXT PRIMARY KEY NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            outcome TEXT NOT NULL,
            feed_digest TEXT NOT NULL,
            details TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transactions_client ON transactions(client_inn)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transactions_place ON transactions(place_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_load_runs_digest ON load_runs(feed_digest)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// READ MODELS
// ============================================================================

/// Row counts per table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoredCounts {
    pub clients: i64,
    pub places: i64,
    pub transactions: i64,
}

/// A transaction row joined with its place name
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTransaction {
    pub id: i64,
    pub amount: Decimal,
    pub currency: String,
    pub card: String,
    pub client_inn: String,
    pub place_id: i64,
    pub place: String,
}

/// One row of the run log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: String,
    pub feed_digest: String,
    pub details: serde_json::Value,
}

pub fn count_rows(conn: &Connection) -> Result<StoredCounts> {
    let count = |table: &str| -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        conn.query_row(&sql, [], |row| row.get(0))
            .with_context(|| format!("Failed to count {}", table))
    };

    Ok(StoredCounts {
        clients: count("clients")?,
        places: count("places")?,
        transactions: count("transactions")?,
    })
}

pub fn get_transaction(conn: &Connection, id: i64) -> Result<Option<StoredTransaction>> {
    let row = conn
        .query_row(
            "SELECT t.id, t.amount, t.currency, t.card, t.client_inn, t.place_id, p.place
             FROM transactions t JOIN places p ON p.id = t.place_id
             WHERE t.id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((id, amount, currency, card, client_inn, place_id, place)) = row else {
        return Ok(None);
    };

    Ok(Some(StoredTransaction {
        id,
        amount: Decimal::from_str(&amount)
            .with_context(|| format!("Stored amount `{}` is not a decimal", amount))?,
        currency,
        card,
        client_inn,
        place_id,
        place,
    }))
}

/// Append a run to the run log
pub fn insert_run(conn: &Connection, summary: &RunSummary) -> Result<()> {
    let details = serde_json::to_string(summary)?;

    conn.execute(
        "INSERT INTO load_runs (
            run_id, started_at, finished_at, outcome, feed_digest, details
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            summary.run_id.to_string(),
            summary.started_at.to_rfc3339(),
            summary.finished_at.to_rfc3339(),
            summary.outcome.as_str(),
            summary.feed_digest,
            details,
        ],
    )?;

    Ok(())
}

/// Runs recorded for a feed, newest first
pub fn get_runs_for_feed(conn: &Connection, feed_digest: &str) -> Result<Vec<RunRecord>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, started_at, finished_at, outcome, feed_digest, details
         FROM load_runs
         WHERE feed_digest = ?1
         ORDER BY started_at DESC",
    )?;

    let rows = stmt
        .query_map(params![feed_digest], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut runs = Vec::with_capacity(rows.len());
    for (run_id, started_at, finished_at, outcome, feed_digest, details) in rows {
        runs.push(RunRecord {
            run_id,
            started_at: DateTime::parse_from_rfc3339(&started_at)?.with_timezone(&Utc),
            finished_at: DateTime::parse_from_rfc3339(&finished_at)?.with_timezone(&Utc),
            outcome,
            feed_digest,
            details: serde_json::from_str(&details)?,
        });
    }

    Ok(runs)
}

// ============================================================================
// SQLITE GATEWAY
// ============================================================================

/// `PersistenceGateway` over one SQLite connection shared by all writers
pub struct SqliteGateway {
    conn: Mutex<Connection>,
    clients: NaturalKeyCache<Client>,
    places: NaturalKeyCache<Place>,
    timeout: Duration,
}

impl SqliteGateway {
    pub fn open(path: &Path, timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        conn.busy_timeout(timeout)?;
        Self::with_connection(conn, timeout)
    }

    pub fn open_in_memory(timeout: Duration) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, timeout)
    }

    fn with_connection(conn: Connection, timeout: Duration) -> Result<Self> {
        setup_database(&conn).context("Failed to set up schema")?;
        info!(timeout_ms = timeout.as_millis() as u64, "database ready");

        Ok(SqliteGateway {
            conn: Mutex::new(conn),
            clients: NaturalKeyCache::new(),
            places: NaturalKeyCache::new(),
            timeout,
        })
    }

    /// Run `f` against the shared connection
    pub fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> R) -> R {
        f(&*self.conn.lock())
    }

    pub fn counts(&self) -> Result<StoredCounts> {
        self.with_conn(count_rows)
    }

    pub fn load_transaction(&self, id: i64) -> Result<Option<StoredTransaction>> {
        self.with_conn(|conn| get_transaction(conn, id))
    }

    pub fn record_run(&self, summary: &RunSummary) -> Result<()> {
        self.with_conn(|conn| insert_run(conn, summary))
    }

    pub fn cached_places(&self) -> usize {
        self.places.len()
    }

    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }

    /// One unit of work. Dropping the SQLite transaction on any error rolls
    /// it back; caches only learn about rows after the commit.
    ///
    /// The deadline covers the work itself, measured from the moment this
    /// gateway holds both its connection and the database write lock.
    pub fn write_batch(&self, batch: &[Transaction]) -> Result<usize, IngestError> {
        let mut conn = self.conn.lock();
        // Writers on other connections are waited out by busy_timeout
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let started = Instant::now();

        let mut new_clients: HashMap<String, Arc<Client>> = HashMap::new();
        let mut new_places: HashMap<String, Arc<Place>> = HashMap::new();

        for transaction in batch {
            self.check_deadline(started)?;

            let client = self.resolve_client(&tx, transaction.client(), &mut new_clients)?;
            let place = self.resolve_place(&tx, transaction.place(), &mut new_places)?;
            let place_id = place
                .id()
                .ok_or(rusqlite::Error::QueryReturnedNoRows)?;

            tx.execute(
                "INSERT INTO transactions (id, amount, currency, card, client_inn, place_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    amount = excluded.amount,
                    currency = excluded.currency,
                    card = excluded.card,
                    client_inn = excluded.client_inn,
                    place_id = excluded.place_id",
                params![
                    transaction.id(),
                    transaction.amount().to_string(),
                    transaction.currency(),
                    transaction.card(),
                    client.inn(),
                    place_id,
                ],
            )?;
        }

        self.check_deadline(started)?;
        tx.commit()?;
        drop(conn);

        self.clients.extend(new_clients);
        self.places.extend(new_places);

        debug!(
            count = batch.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "batch committed"
        );
        Ok(batch.len())
    }

    fn check_deadline(&self, started: Instant) -> Result<(), IngestError> {
        if started.elapsed() >= self.timeout {
            return Err(IngestError::Timeout(self.timeout));
        }
        Ok(())
    }

    fn resolve_client(
        &self,
        conn: &Connection,
        client: &Arc<Client>,
        seen: &mut HashMap<String, Arc<Client>>,
    ) -> Result<Arc<Client>, IngestError> {
        if let Some(cached) = self.clients.get(client.inn()) {
            return Ok(cached);
        }
        if let Some(resolved) = seen.get(client.inn()) {
            return Ok(Arc::clone(resolved));
        }

        let stored = conn
            .query_row(
                "SELECT first_name, last_name, middle_name FROM clients WHERE inn = ?1",
                params![client.inn()],
                |row| {
                    Ok(Client::stored(
                        client.inn(),
                        &row.get::<_, String>(0)?,
                        &row.get::<_, String>(1)?,
                        &row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let resolved = match stored {
            Some(existing) => Arc::new(existing),
            None => {
                conn.execute(
                    "INSERT OR IGNORE INTO clients (inn, first_name, last_name, middle_name)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        client.inn(),
                        client.first_name(),
                        client.last_name(),
                        client.middle_name(),
                    ],
                )?;
                Arc::clone(client)
            }
        };

        seen.insert(client.inn().to_string(), Arc::clone(&resolved));
        Ok(resolved)
    }

    fn resolve_place(
        &self,
        conn: &Connection,
        place: &Place,
        seen: &mut HashMap<String, Arc<Place>>,
    ) -> Result<Arc<Place>, IngestError> {
        if let Some(cached) = self.places.get(place.name()) {
            return Ok(cached);
        }
        if let Some(resolved) = seen.get(place.name()) {
            return Ok(Arc::clone(resolved));
        }

        let lookup = |conn: &Connection| -> rusqlite::Result<Option<i64>> {
            conn.query_row(
                "SELECT id FROM places WHERE place = ?1",
                params![place.name()],
                |row| row.get(0),
            )
            .optional()
        };

        let id = match lookup(conn)? {
            Some(id) => id,
            None => {
                conn.execute(
                    "INSERT OR IGNORE INTO places (place) VALUES (?1)",
                    params![place.name()],
                )?;
                lookup(conn)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?
            }
        };

        let resolved = Arc::new(Place::stored(id, place.name()));
        seen.insert(place.name().to_string(), Arc::clone(&resolved));
        Ok(resolved)
    }
}

impl PersistenceGateway for SqliteGateway {
    fn submit_batch(&self, batch: &[Transaction]) -> usize {
        if batch.is_empty() {
            return 0;
        }

        match self.write_batch(batch) {
            Ok(written) => written,
            Err(err) => {
                warn!(count = batch.len(), error = %err, "batch rolled back");
                0
            }
        }
    }
}
