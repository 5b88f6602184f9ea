use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::StoreError;
use super::remote::{RemoteFile, RemoteRepository, VersionToken, check_version};

/// Schedule kept in a local (or network-mounted) file. The version token is
/// derived from the content, so any external edit to the file is noticed by
/// the next conditional write.
///
/// Writes go to a sibling temp file which is fsynced and renamed over the
/// target: a failed write never leaves a half-written schedule behind.
/// Conditional writes are serialized within this process only.
pub struct FileRepository {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn read_file(&self) -> io::Result<Option<RemoteFile>> {
        match tokio::fs::read(&self.path).await {
            Ok(content) => {
                let version = VersionToken::of_content(&content);
                Ok(Some(RemoteFile { content, version }))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn replace(&self, content: &[u8]) -> io::Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(content).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteRepository for FileRepository {
    async fn read(&self) -> Result<Option<RemoteFile>, StoreError> {
        Ok(self.read_file().await?)
    }

    async fn write(
        &self,
        content: Vec<u8>,
        expected: Option<&VersionToken>,
    ) -> Result<VersionToken, StoreError> {
        let _guard = self.write_lock.lock().await;
        let current = self.read_file().await?;
        check_version(current.as_ref().map(|f| &f.version), expected)?;
        self.replace(&content).await?;
        Ok(VersionToken::of_content(&content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("yardbay_test_file_repo");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let repo = FileRepository::new(test_path("missing.csv"));
        assert!(repo.read().await.unwrap().is_none());
        assert!(repo.current_version().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_then_read() {
        let path = test_path("write_then_read.csv");
        let repo = FileRepository::new(&path);
        let v1 = repo.write(b"Booking_No\nB1\n".to_vec(), None).await.unwrap();
        let file = repo.read().await.unwrap().unwrap();
        assert_eq!(file.content, b"Booking_No\nB1\n");
        assert_eq!(file.version, v1);
        assert!(!repo.tmp_path().exists());
    }

    #[tokio::test]
    async fn creates_parent_directory() {
        let dir = std::env::temp_dir()
            .join("yardbay_test_file_repo")
            .join("nested_parent");
        let _ = std::fs::remove_dir_all(&dir);
        let repo = FileRepository::new(dir.join("schedule.csv"));
        repo.write(b"x".to_vec(), None).await.unwrap();
        assert!(dir.join("schedule.csv").exists());
    }

    #[tokio::test]
    async fn stale_write_leaves_file_untouched() {
        let path = test_path("stale.csv");
        let repo = FileRepository::new(&path);
        let v1 = repo.write(b"one".to_vec(), None).await.unwrap();
        repo.write(b"two".to_vec(), Some(&v1)).await.unwrap();

        let err = repo.write(b"three".to_vec(), Some(&v1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
    }

    #[tokio::test]
    async fn external_edit_is_detected() {
        let path = test_path("external.csv");
        let repo = FileRepository::new(&path);
        let v1 = repo.write(b"ours".to_vec(), None).await.unwrap();

        // Someone edits the sheet behind our back.
        std::fs::write(&path, b"theirs").unwrap();

        let err = repo.write(b"ours again".to_vec(), Some(&v1)).await.unwrap_err();
        match err {
            StoreError::Conflict { found, .. } => {
                assert_eq!(found, Some(VersionToken::of_content(b"theirs")));
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_after_delete_is_not_found() {
        let path = test_path("deleted.csv");
        let repo = FileRepository::new(&path);
        let v1 = repo.write(b"x".to_vec(), None).await.unwrap();
        std::fs::remove_file(&path).unwrap();
        let err = repo.write(b"y".to_vec(), Some(&v1)).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound);
    }
}
