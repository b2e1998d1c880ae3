//! Database schema definitions using SurrealQL.
//!
//! Every timestamp column holds Unix epoch milliseconds.

use crate::{Database, DbError};

/// Tables whose rows carry an `expire_at` watermark, in sweep order.
///
/// Parameters and states follow their job so an expired job leaves nothing
/// behind.
pub const EXPIRABLE_TABLES: &[&str] = &[
    "aggregated_counter",
    "counter",
    "job",
    "job_parameter",
    "state",
    "list_entry",
    "set_entry",
    "hash_entry",
];

/// Initialize the database schema.
///
/// This creates all necessary tables, fields, and indexes.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(QUEUE_SCHEMA).await?.check()?;
    db.query(JOB_SCHEMA).await?.check()?;
    db.query(BOOKKEEPING_SCHEMA).await?.check()?;
    db.query(COORDINATION_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Queue table and the sequence counters used to number its rows.
const QUEUE_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job_queue SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS seq ON job_queue TYPE int;
DEFINE FIELD IF NOT EXISTS job_id ON job_queue TYPE string;
DEFINE FIELD IF NOT EXISTS queue ON job_queue TYPE string;
DEFINE FIELD IF NOT EXISTS fetched_at ON job_queue TYPE option<int>;

DEFINE INDEX IF NOT EXISTS job_queue_seq ON job_queue FIELDS seq UNIQUE;
DEFINE INDEX IF NOT EXISTS job_queue_fetch ON job_queue FIELDS queue, fetched_at;

DEFINE TABLE IF NOT EXISTS id_sequence SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS last_value ON id_sequence TYPE int;
"#;

/// Job, parameter and state tables.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS invocation ON job TYPE string;
DEFINE FIELD IF NOT EXISTS state_id ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS state_name ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS created_at ON job TYPE int;
DEFINE FIELD IF NOT EXISTS expire_at ON job TYPE option<int>;

DEFINE INDEX IF NOT EXISTS job_state_name ON job FIELDS state_name;
DEFINE INDEX IF NOT EXISTS job_expire ON job FIELDS expire_at;

DEFINE TABLE IF NOT EXISTS job_parameter SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS job_id ON job_parameter TYPE string;
DEFINE FIELD IF NOT EXISTS name ON job_parameter TYPE string;
DEFINE FIELD IF NOT EXISTS param_value ON job_parameter TYPE option<string>;
DEFINE FIELD IF NOT EXISTS expire_at ON job_parameter TYPE option<int>;

DEFINE INDEX IF NOT EXISTS job_parameter_name ON job_parameter FIELDS job_id, name UNIQUE;
DEFINE INDEX IF NOT EXISTS job_parameter_expire ON job_parameter FIELDS expire_at;

DEFINE TABLE IF NOT EXISTS state SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS job_id ON state TYPE string;
DEFINE FIELD IF NOT EXISTS name ON state TYPE string;
DEFINE FIELD IF NOT EXISTS reason ON state TYPE option<string>;
DEFINE FIELD IF NOT EXISTS created_at ON state TYPE int;
DEFINE FIELD IF NOT EXISTS expire_at ON state TYPE option<int>;

DEFINE INDEX IF NOT EXISTS state_job ON state FIELDS job_id;
DEFINE INDEX IF NOT EXISTS state_expire ON state FIELDS expire_at;
"#;

/// Generic bookkeeping families consumed by the expiration sweeper.
const BOOKKEEPING_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS counter SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS record_key ON counter TYPE string;
DEFINE FIELD IF NOT EXISTS amount ON counter TYPE int;
DEFINE FIELD IF NOT EXISTS expire_at ON counter TYPE option<int>;
DEFINE INDEX IF NOT EXISTS counter_key ON counter FIELDS record_key;
DEFINE INDEX IF NOT EXISTS counter_expire ON counter FIELDS expire_at;

DEFINE TABLE IF NOT EXISTS aggregated_counter SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS record_key ON aggregated_counter TYPE string;
DEFINE FIELD IF NOT EXISTS amount ON aggregated_counter TYPE int;
DEFINE FIELD IF NOT EXISTS expire_at ON aggregated_counter TYPE option<int>;
DEFINE INDEX IF NOT EXISTS aggregated_counter_key ON aggregated_counter FIELDS record_key UNIQUE;
DEFINE INDEX IF NOT EXISTS aggregated_counter_expire ON aggregated_counter FIELDS expire_at;

DEFINE TABLE IF NOT EXISTS set_entry SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS record_key ON set_entry TYPE string;
DEFINE FIELD IF NOT EXISTS member ON set_entry TYPE string;
DEFINE FIELD IF NOT EXISTS score ON set_entry TYPE float;
DEFINE FIELD IF NOT EXISTS expire_at ON set_entry TYPE option<int>;
DEFINE INDEX IF NOT EXISTS set_entry_member ON set_entry FIELDS record_key, member UNIQUE;
DEFINE INDEX IF NOT EXISTS set_entry_expire ON set_entry FIELDS expire_at;

DEFINE TABLE IF NOT EXISTS hash_entry SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS record_key ON hash_entry TYPE string;
DEFINE FIELD IF NOT EXISTS hash_field ON hash_entry TYPE string;
DEFINE FIELD IF NOT EXISTS field_value ON hash_entry TYPE option<string>;
DEFINE FIELD IF NOT EXISTS expire_at ON hash_entry TYPE option<int>;
DEFINE INDEX IF NOT EXISTS hash_entry_field ON hash_entry FIELDS record_key, hash_field UNIQUE;
DEFINE INDEX IF NOT EXISTS hash_entry_expire ON hash_entry FIELDS expire_at;

DEFINE TABLE IF NOT EXISTS list_entry SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS seq ON list_entry TYPE int;
DEFINE FIELD IF NOT EXISTS record_key ON list_entry TYPE string;
DEFINE FIELD IF NOT EXISTS item ON list_entry TYPE option<string>;
DEFINE FIELD IF NOT EXISTS expire_at ON list_entry TYPE option<int>;
DEFINE INDEX IF NOT EXISTS list_entry_key ON list_entry FIELDS record_key;
DEFINE INDEX IF NOT EXISTS list_entry_expire ON list_entry FIELDS expire_at;
"#;

/// Distributed lock table. The record id is the resource name.
const COORDINATION_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS distributed_lock SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS resource ON distributed_lock TYPE string;
DEFINE FIELD IF NOT EXISTS owner ON distributed_lock TYPE string;
DEFINE FIELD IF NOT EXISTS acquired_at ON distributed_lock TYPE int;
"#;
