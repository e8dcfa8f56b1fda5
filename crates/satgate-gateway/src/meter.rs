//! Per-token call and budget metering.
//!
//! Entries are keyed by token signature and created lazily at the token's
//! declared quota, with a TTL equal to the token's remaining lifetime. The
//! only mutation is an atomic decrement: for calls an unconditional
//! decrement-if-positive, for budgets a conditional decrement-by-cost that
//! never overdraws. A quota must not reset within a token's validity window,
//! so entries are re-initialized only after their TTL — which is the token's
//! own expiry — has passed.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::config::MeterBackendKind;
use crate::metrics::METER_FALLBACKS;

#[derive(Debug, Error)]
pub enum MeterError {
    #[error("meter store failure: {0}")]
    Store(String),
}

impl From<rusqlite::Error> for MeterError {
    fn from(e: rusqlite::Error) -> Self {
        MeterError::Store(e.to_string())
    }
}

/// Result of a call charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallCharge {
    /// Calls left after this charge.
    pub remaining: u64,
    /// True when the quota was already spent; nothing was decremented.
    pub exhausted: bool,
}

/// Result of a budget charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetCharge {
    /// Sats left after this charge (unchanged when `charged` is false).
    pub remaining: u64,
    /// False when the balance could not cover the cost; nothing was taken.
    pub charged: bool,
}

/// The two atomic primitives any metering backend must provide.
///
/// Both are initialize-if-absent + decrement in a single atomic step against
/// the backing store: a load-then-store pair would double-spend under
/// concurrent requests bearing the same token signature.
pub trait MeterStore: Send + Sync {
    fn charge_call(&self, key: &str, initial: u64, ttl_secs: i64) -> Result<CallCharge, MeterError>;

    fn charge_budget(
        &self,
        key: &str,
        initial: u64,
        cost: u64,
        ttl_secs: i64,
    ) -> Result<BudgetCharge, MeterError>;

    /// Return one previously charged call to a live entry. Used when a
    /// compound charge fails partway so the rejected request costs nothing.
    /// A missing or expired entry is a no-op.
    fn refund_call(&self, key: &str) -> Result<(), MeterError>;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    remaining: u64,
    expires_at: i64,
}

/// In-process store. The DashMap entry guard serializes all mutation of one
/// key, so check-and-decrement is a single critical section.
#[derive(Debug, Default)]
pub struct MemoryMeterStore {
    entries: DashMap<String, Entry>,
}

impl MemoryMeterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<T>(
        &self,
        key: &str,
        initial: u64,
        ttl_secs: i64,
        f: impl FnOnce(&mut Entry) -> T,
    ) -> T {
        let now = unix_now();
        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            remaining: initial,
            expires_at: now + ttl_secs.max(0),
        });
        // Reset only once the old window has truly ended; the token that
        // created it is expired by then, so this never refreshes a live quota.
        if entry.expires_at <= now {
            *entry = Entry {
                remaining: initial,
                expires_at: now + ttl_secs.max(0),
            };
        }
        f(&mut entry)
    }
}

impl MeterStore for MemoryMeterStore {
    fn charge_call(&self, key: &str, initial: u64, ttl_secs: i64) -> Result<CallCharge, MeterError> {
        Ok(self.with_entry(key, initial, ttl_secs, |entry| {
            if entry.remaining == 0 {
                CallCharge {
                    remaining: 0,
                    exhausted: true,
                }
            } else {
                entry.remaining -= 1;
                CallCharge {
                    remaining: entry.remaining,
                    exhausted: false,
                }
            }
        }))
    }

    fn charge_budget(
        &self,
        key: &str,
        initial: u64,
        cost: u64,
        ttl_secs: i64,
    ) -> Result<BudgetCharge, MeterError> {
        Ok(self.with_entry(key, initial, ttl_secs, |entry| {
            if entry.remaining >= cost {
                entry.remaining -= cost;
                BudgetCharge {
                    remaining: entry.remaining,
                    charged: true,
                }
            } else {
                BudgetCharge {
                    remaining: entry.remaining,
                    charged: false,
                }
            }
        }))
    }

    fn refund_call(&self, key: &str) -> Result<(), MeterError> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.expires_at > unix_now() {
                entry.remaining += 1;
            }
        }
        Ok(())
    }
}

/// SQLite-backed store for cross-process consistency. The conditional
/// `UPDATE ... WHERE remaining >= cost` is the atomic check-and-decrement;
/// sqlite serializes writers, so two gateway processes sharing the file
/// cannot double-spend a quota.
pub struct SqliteMeterStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMeterStore {
    pub fn new(path: &str) -> Result<Self, MeterError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS meter (
                 key        TEXT PRIMARY KEY,
                 remaining  INTEGER NOT NULL,
                 expires_at INTEGER NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn charge(
        &self,
        key: &str,
        initial: u64,
        cost: u64,
        ttl_secs: i64,
    ) -> Result<(u64, bool), MeterError> {
        let now = unix_now();
        let conn = self
            .conn
            .lock()
            .map_err(|_| MeterError::Store("meter lock poisoned".to_string()))?;

        // Drop the row only after its window ended; see module docs.
        conn.execute(
            "DELETE FROM meter WHERE key = ?1 AND expires_at <= ?2",
            params![key, now],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO meter (key, remaining, expires_at) VALUES (?1, ?2, ?3)",
            params![key, initial, now + ttl_secs.max(0)],
        )?;
        let changed = conn.execute(
            "UPDATE meter SET remaining = remaining - ?2 WHERE key = ?1 AND remaining >= ?2",
            params![key, cost],
        )?;
        let remaining: u64 = conn
            .query_row(
                "SELECT remaining FROM meter WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        Ok((remaining, changed > 0))
    }
}

impl MeterStore for SqliteMeterStore {
    fn charge_call(&self, key: &str, initial: u64, ttl_secs: i64) -> Result<CallCharge, MeterError> {
        let (remaining, charged) = self.charge(key, initial, 1, ttl_secs)?;
        Ok(CallCharge {
            remaining,
            exhausted: !charged,
        })
    }

    fn charge_budget(
        &self,
        key: &str,
        initial: u64,
        cost: u64,
        ttl_secs: i64,
    ) -> Result<BudgetCharge, MeterError> {
        let (remaining, charged) = self.charge(key, initial, cost, ttl_secs)?;
        Ok(BudgetCharge { remaining, charged })
    }

    fn refund_call(&self, key: &str) -> Result<(), MeterError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| MeterError::Store("meter lock poisoned".to_string()))?;
        conn.execute(
            "UPDATE meter SET remaining = remaining + 1 WHERE key = ?1 AND expires_at > ?2",
            params![key, unix_now()],
        )?;
        Ok(())
    }
}

enum PrimaryStore {
    Memory(MemoryMeterStore),
    Sqlite(SqliteMeterStore),
}

/// The metering engine: the configured store plus an in-process fallback.
///
/// A store outage degrades to the fallback with a logged, counted loss of
/// cross-process consistency. It never degrades into unmetered access: the
/// request is charged against the local quota instead.
pub struct Meter {
    primary: PrimaryStore,
    fallback: MemoryMeterStore,
}

impl Meter {
    pub fn new(backend: MeterBackendKind, db_path: &str) -> Result<Self, MeterError> {
        let primary = match backend {
            MeterBackendKind::Memory => PrimaryStore::Memory(MemoryMeterStore::new()),
            MeterBackendKind::Sqlite => PrimaryStore::Sqlite(SqliteMeterStore::new(db_path)?),
        };
        Ok(Self {
            primary,
            fallback: MemoryMeterStore::new(),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            primary: PrimaryStore::Memory(MemoryMeterStore::new()),
            fallback: MemoryMeterStore::new(),
        }
    }

    pub fn charge_call(&self, token_sig: &str, max_calls: u64, ttl_secs: i64) -> CallCharge {
        let key = format!("calls:{token_sig}");
        let result = match &self.primary {
            PrimaryStore::Memory(s) => s.charge_call(&key, max_calls, ttl_secs),
            PrimaryStore::Sqlite(s) => s.charge_call(&key, max_calls, ttl_secs),
        };
        match result {
            Ok(charge) => charge,
            Err(e) => {
                tracing::warn!(error = %e, "meter store failed, degrading to in-process fallback");
                METER_FALLBACKS.inc();
                self.fallback
                    .charge_call(&key, max_calls, ttl_secs)
                    .unwrap_or(CallCharge {
                        remaining: 0,
                        exhausted: true,
                    })
            }
        }
    }

    pub fn charge_budget(
        &self,
        token_sig: &str,
        budget: u64,
        cost: u64,
        ttl_secs: i64,
    ) -> BudgetCharge {
        let key = format!("budget:{token_sig}");
        let result = match &self.primary {
            PrimaryStore::Memory(s) => s.charge_budget(&key, budget, cost, ttl_secs),
            PrimaryStore::Sqlite(s) => s.charge_budget(&key, budget, cost, ttl_secs),
        };
        match result {
            Ok(charge) => charge,
            Err(e) => {
                tracing::warn!(error = %e, "meter store failed, degrading to in-process fallback");
                METER_FALLBACKS.inc();
                self.fallback
                    .charge_budget(&key, budget, cost, ttl_secs)
                    .unwrap_or(BudgetCharge {
                        remaining: 0,
                        charged: false,
                    })
            }
        }
    }

    pub fn refund_call(&self, token_sig: &str) {
        let key = format!("calls:{token_sig}");
        let result = match &self.primary {
            PrimaryStore::Memory(s) => s.refund_call(&key),
            PrimaryStore::Sqlite(s) => s.refund_call(&key),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "meter store failed, refunding against in-process fallback");
            METER_FALLBACKS.inc();
            let _ = self.fallback.refund_call(&key);
        }
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
