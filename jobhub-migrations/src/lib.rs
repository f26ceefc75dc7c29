use sqlx::migrate::Migrator;

/// Schema for the `jobs` and `job_instances` tables.
pub static SQLITE_MIGRATOR: Migrator = sqlx::migrate!("src/migrations_sqlite");

pub fn sqlite_migrator() -> &'static Migrator {
    &SQLITE_MIGRATOR
}
