use thiserror::Error;

#[derive(Debug, Error)]
pub enum HiveError {
    #[error("database is busy: {0}")]
    Busy(String),

    #[error("database is locked: {0}")]
    Locked(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("type or dimension mismatch: {0}")]
    Mismatch(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("dependency cycle: {0} would block itself through {1}")]
    Cycle(String, String),

    #[error("dependency graph deeper than {0} levels; refusing to traverse")]
    GraphTooDeep(usize),

    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("embedder unavailable: {0}")]
    Embedder(String),

    #[error("WAL exceeds health threshold: {0}")]
    WalBloat(String),

    #[error("merge conflict on record '{0}'")]
    Conflict(String),

    #[error("client disconnected")]
    ClientGone,

    #[error("line {line} out of range 1..{max}")]
    OutOfRange { line: usize, max: usize },

    #[error("invalid status transition: {0} -> {1}")]
    InvalidTransition(String, String),

    #[error("reservation conflict: '{requested}' overlaps '{held}' held by agent '{owner}'")]
    ReservationConflict {
        requested: String,
        held: String,
        owner: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HiveError {
    /// Stable machine-readable code, used in HTTP error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Busy(_) => "busy",
            Self::Locked(_) => "locked",
            Self::Constraint(_) => "constraint",
            Self::Mismatch(_) => "mismatch",
            Self::Schema(_) => "schema",
            Self::NotFound { .. } => "not_found",
            Self::Cycle(_, _) => "cycle",
            Self::GraphTooDeep(_) => "graph_too_deep",
            Self::Parse { .. } => "parse",
            Self::Embedder(_) => "embedder",
            Self::WalBloat(_) => "wal_bloat",
            Self::Conflict(_) => "conflict",
            Self::ClientGone => "client_gone",
            Self::OutOfRange { .. } => "out_of_range",
            Self::InvalidTransition(_, _) => "invalid_transition",
            Self::ReservationConflict { .. } => "reservation_conflict",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }

    /// Whether retrying the same operation can succeed without intervention.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Locked(_) | Self::Embedder(_))
    }
}

impl From<rusqlite::Error> for HiveError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(code, msg) => {
                let detail = msg.clone().unwrap_or_else(|| code.to_string());
                match code.code {
                    ErrorCode::DatabaseBusy => Self::Busy(detail),
                    ErrorCode::DatabaseLocked => Self::Locked(detail),
                    ErrorCode::ConstraintViolation => Self::Constraint(detail),
                    ErrorCode::TypeMismatch => Self::Mismatch(detail),
                    ErrorCode::SchemaChanged => Self::Schema(detail),
                    _ => Self::Schema(detail),
                }
            }
            rusqlite::Error::InvalidColumnType(_, name, ty) => {
                Self::Mismatch(format!("column '{name}' has unexpected type {ty}"))
            }
            other => Self::Schema(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, HiveError>;
