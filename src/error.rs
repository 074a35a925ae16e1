use thiserror::Error;

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("no data: {0}")]
    NotFound(String),

    #[error("{context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Csv {
        context: &'static str,
        #[source]
        source: csv::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("snapshots are disabled")]
    Disabled,

    #[error("unauthorized")]
    Unauthorized,
}

pub type Result<T> = std::result::Result<T, DashboardError>;

impl DashboardError {
    /// Stable machine-readable code, used by the adapter binary.
    pub fn category(&self) -> &'static str {
        match self {
            DashboardError::Validation(_) => "VALIDATION_ERROR",
            DashboardError::NotFound(_) => "NO_DATA_ERROR",
            DashboardError::Database { .. } => "DATABASE_ERROR",
            DashboardError::Io { .. } | DashboardError::Csv { .. } => "IO_ERROR",
            DashboardError::Config(_) => "CONFIG_ERROR",
            DashboardError::Upstream(_) => "UPSTREAM_ERROR",
            DashboardError::Disabled => "DISABLED",
            DashboardError::Unauthorized => "UNAUTHORIZED",
        }
    }
}

pub(crate) fn db_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> DashboardError {
    move |source| DashboardError::Database { context, source }
}

pub(crate) fn io_err(context: &'static str) -> impl FnOnce(std::io::Error) -> DashboardError {
    move |source| DashboardError::Io { context, source }
}

pub(crate) fn csv_err(context: &'static str) -> impl FnOnce(csv::Error) -> DashboardError {
    move |source| DashboardError::Csv { context, source }
}

pub(crate) fn invalid(message: impl Into<String>) -> DashboardError {
    DashboardError::Validation(message.into())
}
