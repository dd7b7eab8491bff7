use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row in {table}: {message}")]
    CorruptRow {
        table: &'static str,
        message: String,
    },
}

impl Error {
    #[must_use]
    pub fn corrupt_row(table: &'static str, message: impl Into<String>) -> Self {
        Self::CorruptRow {
            table,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Wrap a store failure for the relay engine's traits.
pub(crate) fn into_relay(context: &str, error: impl Into<Error>) -> threadrelay_core::Error {
    threadrelay_core::Error::store(context, error.into())
}
