pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("sqlite migrate error: {0}")]
    SqliteMigrate(#[from] sqlx::migrate::MigrateError),

    #[error("login required")]
    LoginRequired,

    #[error("access denied: {message}")]
    AccessDenied { message: String },

    #[error("message not found")]
    NotFound,

    #[error("rate limited for {seconds}s")]
    RateLimited { seconds: u64 },

    #[error("no session available")]
    NoSessionAvailable,

    #[error("another operation is already running for this user")]
    Busy,

    #[error("transient io error: {message}")]
    TransientIo { message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("telegram error: {message}")]
    Telegram { message: String },

    #[error("unexpected error: {message}")]
    Unexpected { message: String },
}

impl Error {
    /// Retryable with a fresh resource. Everything else either surfaces
    /// immediately or is handled by a dedicated branch (flood wait).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientIo { .. } | Error::Io(_))
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Error::Unexpected {
            message: message.into(),
        }
    }
}
