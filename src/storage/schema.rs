//! Database schema constants.
//!
//! Every statement is idempotent (`IF NOT EXISTS`) and holds a single SQL
//! command so it can run as one prepared statement.

/// SQL schema for creating the persons table.
pub const CREATE_PERSONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS persons (
    id BIGSERIAL PRIMARY KEY,
    email VARCHAR(320) NOT NULL UNIQUE,
    first_name VARCHAR(255) NOT NULL,
    last_name VARCHAR(255) NOT NULL,
    date_of_birth DATE NOT NULL,
    time_zone VARCHAR(64) NOT NULL,
    city VARCHAR(255) NOT NULL,
    country VARCHAR(255) NOT NULL,
    location JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_notified_at TIMESTAMPTZ
)
"#;

/// Case-insensitive email uniqueness.
pub const CREATE_EMAIL_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_persons_email_lower ON persons(LOWER(email))
"#;

/// Index on `last_notified_at`.
pub const CREATE_LAST_NOTIFIED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_persons_last_notified_at ON persons(last_notified_at)
"#;

/// Delivery lease column, added separately so existing tables get it too.
pub const ADD_CLAIMED_UNTIL_COLUMN: &str = r#"
ALTER TABLE persons ADD COLUMN IF NOT EXISTS notification_claimed_until TIMESTAMPTZ
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_PERSONS_TABLE,
        CREATE_EMAIL_INDEX,
        CREATE_LAST_NOTIFIED_INDEX,
        ADD_CLAIMED_UNTIL_COLUMN,
    ]
}

/// Table names in the schema.
pub mod tables {
    /// Persons table name.
    pub const PERSONS: &str = "persons";
    /// Migration bookkeeping table name.
    pub const MIGRATIONS: &str = "_migrations";
}
