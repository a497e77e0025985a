use ::duckdb::Connection;

struct Migration {
    version: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_quota_state",
        sql: r#"
CREATE TABLE IF NOT EXISTS quota_state (
    ledger_id TEXT PRIMARY KEY,
    used_units BIGINT NOT NULL,
    daily_budget BIGINT NOT NULL,
    reset_at_unix BIGINT NOT NULL,
    version BIGINT NOT NULL,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    },
    Migration {
        version: "0002_job_log",
        sql: r#"
CREATE TABLE IF NOT EXISTS job_log (
    job_id TEXT NOT NULL,
    operation_type TEXT NOT NULL,
    owner_id TEXT,
    status TEXT NOT NULL,
    attempts BIGINT NOT NULL,
    error_code TEXT,
    finished_at_unix BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_log_finished ON job_log(finished_at_unix);
"#,
    },
];

pub fn apply_migrations(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    )?;

    for migration in MIGRATIONS {
        let applied: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            [migration.version],
            |row| row.get(0),
        )?;

        if applied == 0 {
            connection.execute_batch(migration.sql)?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                [migration.version],
            )?;
        }
    }

    Ok(())
}
