//! Counters, sets, hashes and lists keyed by a string.
//!
//! These are thin pass-throughs for the engine's bookkeeping and dashboards.
//! Rows carry an optional `expire_at` that the expiration sweeper honours.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use queue_core::Clock;
use serde::Deserialize;
use ulid::Ulid;

use super::{expire_at, next_sequence};
use crate::{ConnectionGate, DbError};

/// Key families that support key-wide expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFamily {
    Set,
    Hash,
    List,
}

impl KeyFamily {
    fn table(self) -> &'static str {
        match self {
            KeyFamily::Set => "set_entry",
            KeyFamily::Hash => "hash_entry",
            KeyFamily::List => "list_entry",
        }
    }
}

#[derive(Debug, Deserialize)]
struct TotalRecord {
    total: i64,
}

#[derive(Debug, Deserialize)]
struct MemberRecord {
    member: String,
}

#[derive(Debug, Deserialize)]
struct HashRecord {
    hash_field: String,
    #[serde(default)]
    field_value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListRecord {
    #[serde(default)]
    item: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExpiryRecord {
    expire_at: i64,
}

fn require_key(key: &str) -> Result<String, DbError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(DbError::InvalidArgument("key must not be empty".into()));
    }
    Ok(key.to_string())
}

#[derive(Clone)]
pub struct KeyValueRepository {
    gate: ConnectionGate,
    clock: Arc<dyn Clock>,
}

impl KeyValueRepository {
    pub fn new(gate: ConnectionGate, clock: Arc<dyn Clock>) -> Self {
        Self { gate, clock }
    }

    /// Record a counter delta. Deltas are summed on read.
    pub async fn increment_counter(
        &self,
        key: &str,
        amount: i64,
        expire_in: Option<Duration>,
    ) -> Result<(), DbError> {
        let key = require_key(key)?;
        let expires = expire_in.map(|ttl| expire_at(self.clock.now_millis(), ttl));
        let id = Ulid::new().to_string();

        self.gate
            .with_connection(true, |db| async move {
                db.query(
                    "CREATE type::thing('counter', $id) SET record_key = $key, amount = $amount, expire_at = $expire_at",
                )
                .bind(("id", id))
                .bind(("key", key))
                .bind(("amount", amount))
                .bind(("expire_at", expires))
                .await?
                .check()?;
                Ok(())
            })
            .await
    }

    /// Sum of raw and aggregated deltas for `key`.
    pub async fn counter_value(&self, key: &str) -> Result<i64, DbError> {
        let key = require_key(key)?;

        self.gate
            .with_connection(false, |db| async move {
                let mut response = db
                    .query(
                        r#"
                        SELECT math::sum(amount) AS total FROM counter WHERE record_key = $key GROUP ALL;
                        SELECT math::sum(amount) AS total FROM aggregated_counter WHERE record_key = $key GROUP ALL;
                        "#,
                    )
                    .bind(("key", key))
                    .await?;
                let raw: Vec<TotalRecord> = response.take(0)?;
                let aggregated: Vec<TotalRecord> = response.take(1)?;
                Ok(raw.iter().chain(aggregated.iter()).map(|r| r.total).sum())
            })
            .await
    }

    pub async fn add_to_set(&self, key: &str, member: &str, score: f64) -> Result<(), DbError> {
        let key = require_key(key)?;
        let member = member.to_string();

        self.gate
            .with_connection(true, |db| async move {
                db.query(
                    "UPSERT type::thing('set_entry', [$key, $member]) SET record_key = $key, member = $member, score = $score",
                )
                .bind(("key", key))
                .bind(("member", member))
                .bind(("score", score))
                .await?
                .check()?;
                Ok(())
            })
            .await
    }

    pub async fn remove_from_set(&self, key: &str, member: &str) -> Result<(), DbError> {
        let key = require_key(key)?;
        let member = member.to_string();

        self.gate
            .with_connection(true, |db| async move {
                db.query("DELETE type::thing('set_entry', [$key, $member])")
                    .bind(("key", key))
                    .bind(("member", member))
                    .await?
                    .check()?;
                Ok(())
            })
            .await
    }

    /// Members of the set, lowest score first.
    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, DbError> {
        let key = require_key(key)?;

        self.gate
            .with_connection(false, |db| async move {
                let mut response = db
                    .query("SELECT member, score FROM set_entry WHERE record_key = $key ORDER BY score ASC")
                    .bind(("key", key))
                    .await?;
                let records: Vec<MemberRecord> = response.take(0)?;
                Ok(records.into_iter().map(|r| r.member).collect())
            })
            .await
    }

    pub async fn set_hash_fields(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), DbError> {
        let key = require_key(key)?;
        let fields: Vec<(String, String)> = fields
            .iter()
            .map(|(field, value)| (field.to_string(), value.to_string()))
            .collect();

        self.gate
            .with_connection(true, |db| async move {
                for (field, value) in fields {
                    db.query(
                        "UPSERT type::thing('hash_entry', [$key, $field]) SET record_key = $key, hash_field = $field, field_value = $value",
                    )
                    .bind(("key", key.clone()))
                    .bind(("field", field))
                    .bind(("value", value))
                    .await?
                    .check()?;
                }
                Ok(())
            })
            .await
    }

    pub async fn hash_fields(&self, key: &str) -> Result<BTreeMap<String, String>, DbError> {
        let key = require_key(key)?;

        self.gate
            .with_connection(false, |db| async move {
                let mut response = db
                    .query("SELECT hash_field, field_value FROM hash_entry WHERE record_key = $key")
                    .bind(("key", key))
                    .await?;
                let records: Vec<HashRecord> = response.take(0)?;
                Ok(records
                    .into_iter()
                    .map(|r| (r.hash_field, r.field_value.unwrap_or_default()))
                    .collect())
            })
            .await
    }

    /// Push an item onto the head of the list.
    pub async fn insert_to_list(&self, key: &str, item: &str) -> Result<(), DbError> {
        let key = require_key(key)?;
        let item = item.to_string();

        self.gate
            .with_connection(true, |db| async move {
                let seq = next_sequence(&db, "list_entry").await?;
                db.query(
                    "CREATE type::thing('list_entry', $seq) SET seq = $seq, record_key = $key, item = $item",
                )
                .bind(("seq", seq))
                .bind(("key", key))
                .bind(("item", item))
                .await?
                .check()?;
                Ok(())
            })
            .await
    }

    /// Items `from..=to` counting from the most recently inserted.
    pub async fn list_range(&self, key: &str, from: usize, to: usize) -> Result<Vec<String>, DbError> {
        let key = require_key(key)?;
        if to < from {
            return Ok(Vec::new());
        }
        let start = from as i64;
        let limit = (to - from + 1) as i64;

        self.gate
            .with_connection(false, |db| async move {
                let mut response = db
                    .query(
                        "SELECT seq, item FROM list_entry WHERE record_key = $key ORDER BY seq DESC LIMIT $limit START $start",
                    )
                    .bind(("key", key))
                    .bind(("limit", limit))
                    .bind(("start", start))
                    .await?;
                let records: Vec<ListRecord> = response.take(0)?;
                Ok(records
                    .into_iter()
                    .map(|r| r.item.unwrap_or_default())
                    .collect())
            })
            .await
    }

    /// Expire every row of `key` in `family` after `ttl`.
    pub async fn expire(&self, family: KeyFamily, key: &str, ttl: Duration) -> Result<(), DbError> {
        let at = expire_at(self.clock.now_millis(), ttl);
        self.set_key_expiry(family, key, Some(at)).await
    }

    /// Remove any expiry from `key` in `family`.
    pub async fn persist(&self, family: KeyFamily, key: &str) -> Result<(), DbError> {
        self.set_key_expiry(family, key, None).await
    }

    /// Time left before the earliest row of `key` expires, or `None` when
    /// nothing under the key is set to expire.
    pub async fn ttl(&self, family: KeyFamily, key: &str) -> Result<Option<Duration>, DbError> {
        let key = require_key(key)?;
        let table = family.table();
        let now = self.clock.now_millis();

        let earliest = self
            .gate
            .with_connection(false, |db| async move {
                let mut response = db
                    .query(
                        "SELECT expire_at FROM type::table($table) WHERE record_key = $key AND expire_at != NONE ORDER BY expire_at ASC LIMIT 1",
                    )
                    .bind(("table", table))
                    .bind(("key", key))
                    .await?;
                let records: Vec<ExpiryRecord> = response.take(0)?;
                Ok(records.into_iter().next().map(|r| r.expire_at))
            })
            .await?;

        Ok(earliest.map(|at| Duration::from_millis(at.saturating_sub(now).max(0) as u64)))
    }

    async fn set_key_expiry(
        &self,
        family: KeyFamily,
        key: &str,
        at: Option<i64>,
    ) -> Result<(), DbError> {
        let key = require_key(key)?;
        let table = family.table();

        self.gate
            .with_connection(true, |db| async move {
                db.query("UPDATE type::table($table) SET expire_at = $at WHERE record_key = $key")
                    .bind(("table", table))
                    .bind(("key", key))
                    .bind(("at", at))
                    .await?
                    .check()?;
                Ok(())
            })
            .await
    }
}
