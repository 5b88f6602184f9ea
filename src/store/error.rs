use super::VersionToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Network, auth or file-system failure talking to the remote.
    Unavailable(String),
    /// The remote version moved since the caller's view was taken.
    Conflict {
        expected: Option<VersionToken>,
        found: Option<VersionToken>,
    },
    /// A conditional write referred to a file that does not exist.
    NotFound,
    /// The stored table could not be decoded.
    Malformed(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            StoreError::Conflict { expected, found } => write!(
                f,
                "version conflict: expected {}, found {}",
                VersionToken::describe(expected.as_ref()),
                VersionToken::describe(found.as_ref()),
            ),
            StoreError::NotFound => write!(f, "schedule file not found"),
            StoreError::Malformed(e) => write!(f, "malformed schedule: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}
