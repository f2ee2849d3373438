#[derive(Debug)]
pub enum DbInitError {
    Open {
        path: std::path::PathBuf,
        source: rusqlite::Error,
    },
    Pragma {
        source: rusqlite::Error,
    },
    Schema {
        source: rusqlite::Error,
    },
    VersionTooOld {
        found: i32,
        expected: i32,
    },
    VersionTooNew {
        found: i32,
        expected: i32,
    },
}

impl std::fmt::Display for DbInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { path, source } => {
                write!(f, "failed to open '{}': {source}", path.display())
            }
            Self::Pragma { source } => write!(f, "failed to read database version: {source}"),
            Self::Schema { source } => write!(f, "failed to initialize database schema: {source}"),
            Self::VersionTooOld { found, expected } => write!(
                f,
                "database version {found} predates this client (need {expected}); \
                 run the database upgrade tool first"
            ),
            Self::VersionTooNew { found, expected } => write!(
                f,
                "database version {found} is newer than this client understands \
                 ({expected}); upgrade the client"
            ),
        }
    }
}

impl std::error::Error for DbInitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { source, .. } | Self::Pragma { source } | Self::Schema { source } => {
                Some(source)
            }
            Self::VersionTooOld { .. } | Self::VersionTooNew { .. } => None,
        }
    }
}

#[derive(Debug)]
pub enum DbError {
    /// The service thread is gone; the request was not submitted.
    Closed,
    /// The query failed, or its enclosing transaction was rolled back.
    Query(String),
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "database service is not running"),
            Self::Query(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for DbError {}
