use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("storage invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to create sqlite directory at {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to configure sqlite pragma '{pragma}'"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to run sqlite migrations"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to serialize {what} at {stage}"))]
    Serialize {
        stage: &'static str,
        what: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to deserialize {what} at {stage}"))]
    Deserialize {
        stage: &'static str,
        what: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to create fallback store directory at {path}"))]
    CreateFallbackDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to read fallback store from {path}"))]
    ReadFallbackStore {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to write fallback store to {path}"))]
    WriteFallbackStore {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display(
        "fallback store write of {attempted_bytes} bytes exceeds the {ceiling_bytes} byte ceiling"
    ))]
    FallbackCapacityExceeded {
        stage: &'static str,
        attempted_bytes: usize,
        ceiling_bytes: usize,
    },
    #[snafu(display("failed to create shadow backup directory at {path}"))]
    CreateShadowDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to write shadow backup to {path}"))]
    WriteShadowBackup {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to remove shadow backup at {path}"))]
    RemoveShadowBackup {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
