use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::StoreError;

/// Opaque version of the remote file. Changes whenever the content changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Content-addressed token: CRC32 plus length of the stored bytes.
    pub fn of_content(bytes: &[u8]) -> Self {
        Self(format!("{:08x}-{:x}", crc32fast::hash(bytes), bytes.len()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn describe(token: Option<&VersionToken>) -> &str {
        token.map_or("<none>", |t| t.as_str())
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub content: Vec<u8>,
    pub version: VersionToken,
}

/// Durable home of the authoritative table: a single file with
/// compare-and-swap writes.
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    /// Current content, or `None` if nothing has been written yet.
    async fn read(&self) -> Result<Option<RemoteFile>, StoreError>;

    /// Replace the content if the stored version still equals `expected`.
    /// `expected = None` creates the file and fails if one already exists.
    /// A failed write leaves the stored content untouched.
    async fn write(
        &self,
        content: Vec<u8>,
        expected: Option<&VersionToken>,
    ) -> Result<VersionToken, StoreError>;

    async fn current_version(&self) -> Result<Option<VersionToken>, StoreError> {
        Ok(self.read().await?.map(|f| f.version))
    }
}

/// Compare the stored version against the caller's expectation.
pub(crate) fn check_version(
    current: Option<&VersionToken>,
    expected: Option<&VersionToken>,
) -> Result<(), StoreError> {
    match (current, expected) {
        (None, Some(_)) => Err(StoreError::NotFound),
        (c, e) if c == e => Ok(()),
        (c, e) => Err(StoreError::Conflict {
            expected: e.cloned(),
            found: c.cloned(),
        }),
    }
}

/// In-process repository. Used by tests and for running without a backing
/// file; `set_unavailable` simulates an unreachable remote.
#[derive(Default)]
pub struct MemoryRepository {
    file: Mutex<Option<RemoteFile>>,
    unavailable: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(content: Vec<u8>) -> Self {
        let version = VersionToken::of_content(&content);
        Self {
            file: Mutex::new(Some(RemoteFile { content, version })),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn ensure_up(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("remote unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteRepository for MemoryRepository {
    async fn read(&self) -> Result<Option<RemoteFile>, StoreError> {
        self.ensure_up()?;
        Ok(self.file.lock().await.clone())
    }

    async fn write(
        &self,
        content: Vec<u8>,
        expected: Option<&VersionToken>,
    ) -> Result<VersionToken, StoreError> {
        self.ensure_up()?;
        let mut file = self.file.lock().await;
        check_version(file.as_ref().map(|f| &f.version), expected)?;
        let version = VersionToken::of_content(&content);
        *file = Some(RemoteFile {
            content,
            version: version.clone(),
        });
        Ok(version)
    }
}
