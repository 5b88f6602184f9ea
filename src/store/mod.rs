mod codec;
mod error;
mod file;
mod remote;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use codec::{CsvCodec, JsonCodec, RawTable, TableCodec, decode_bookings, encode_bookings};
pub use error::StoreError;
pub use file::FileRepository;
pub use remote::{MemoryRepository, RemoteFile, RemoteRepository, VersionToken};

use crate::limits::MAX_TABLE_BYTES;
use crate::model::Table;
use crate::observability;

/// A typed copy of the table together with the version it was read at.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub table: Table,
    /// `None` when the remote file does not exist yet.
    pub version: Option<VersionToken>,
    pub fetched_at: Instant,
}

struct CacheState {
    entry: Option<Fetched>,
    /// Bumped on every invalidation so an in-flight read cannot repopulate
    /// the cache with a table older than a commit.
    generation: u64,
}

/// Read/write access to the authoritative table with a short-lived read cache.
///
/// Reads within `ttl` of the last remote read are served from the cache.
/// Every commit attempt drops the cache, so the next fetch goes to the remote.
pub struct ScheduleStore {
    remote: Arc<dyn RemoteRepository>,
    codec: Arc<dyn TableCodec>,
    ttl: Duration,
    cache: Mutex<CacheState>,
}

impl ScheduleStore {
    pub fn new(
        remote: Arc<dyn RemoteRepository>,
        codec: Arc<dyn TableCodec>,
        ttl: Duration,
    ) -> Self {
        Self {
            remote,
            codec,
            ttl,
            cache: Mutex::new(CacheState {
                entry: None,
                generation: 0,
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Table as of at most `ttl` ago.
    pub async fn fetch(&self) -> Result<Fetched, StoreError> {
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.entry.as_ref()
                && entry.fetched_at.elapsed() < self.ttl
            {
                metrics::counter!(observability::STORE_FETCHES_TOTAL, "source" => "cache")
                    .increment(1);
                return Ok(entry.clone());
            }
        }
        self.fetch_live().await
    }

    /// Table as it is on the remote right now, bypassing the cache.
    pub async fn fetch_live(&self) -> Result<Fetched, StoreError> {
        let generation = self.cache.lock().await.generation;
        let start = std::time::Instant::now();

        let result = self.read_remote().await;
        metrics::histogram!(observability::STORE_READ_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());
        let fetched = match result {
            Ok(f) => f,
            Err(e) => {
                metrics::counter!(observability::STORE_FETCHES_TOTAL, "source" => "error")
                    .increment(1);
                warn!("schedule fetch failed: {e}");
                return Err(e);
            }
        };
        metrics::counter!(observability::STORE_FETCHES_TOTAL, "source" => "live").increment(1);
        debug!(
            bookings = fetched.table.len(),
            rejected = fetched.table.rejected.len(),
            version = VersionToken::describe(fetched.version.as_ref()),
            "fetched schedule"
        );

        let mut cache = self.cache.lock().await;
        if cache.generation == generation {
            cache.entry = Some(fetched.clone());
        }
        Ok(fetched)
    }

    async fn read_remote(&self) -> Result<Fetched, StoreError> {
        let file = self.remote.read().await?;
        let fetched_at = Instant::now();
        let Some(file) = file else {
            return Ok(Fetched {
                table: Table::default(),
                version: None,
                fetched_at,
            });
        };
        if file.content.len() > MAX_TABLE_BYTES {
            return Err(StoreError::Malformed(format!(
                "{} bytes exceeds the limit of {MAX_TABLE_BYTES}",
                file.content.len()
            )));
        }
        let raw = self.codec.decode(&file.content)?;
        Ok(Fetched {
            table: decode_bookings(&raw)?,
            version: Some(file.version),
            fetched_at,
        })
    }

    /// Write `table` if the remote is still at `expected`. On conflict the
    /// remote is left as it was. The cache is dropped either way.
    pub async fn commit(
        &self,
        table: &Table,
        expected: Option<&VersionToken>,
    ) -> Result<VersionToken, StoreError> {
        let bytes = self.codec.encode(&encode_bookings(table))?;
        if bytes.len() > MAX_TABLE_BYTES {
            return Err(StoreError::Malformed(format!(
                "{} bytes exceeds the limit of {MAX_TABLE_BYTES}",
                bytes.len()
            )));
        }

        let result = self.remote.write(bytes, expected).await;
        self.invalidate().await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(StoreError::Conflict { .. }) => "conflict",
            Err(_) => "error",
        };
        metrics::counter!(observability::STORE_COMMITS_TOTAL, "outcome" => outcome).increment(1);
        match &result {
            Ok(version) => debug!(%version, bookings = table.len(), "committed schedule"),
            Err(e) => warn!("schedule commit failed: {e}"),
        }
        result
    }

    pub async fn invalidate(&self) {
        let mut cache = self.cache.lock().await;
        cache.entry = None;
        cache.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Booking, BookingNo, Status};

    const SHEET: &[u8] = b"Booking_No,Zone,Bay,Time,Status\nB1,Zone 1,Bay 1,09:00,Arrived\nB2,Zone 2,,09:30,Expected\n";

    fn store_over(repo: Arc<MemoryRepository>) -> ScheduleStore {
        ScheduleStore::new(repo, Arc::new(CsvCodec), Duration::from_secs(3))
    }

    fn booking(no: &str, zone: &str, time: &str) -> Booking {
        Booking::new(BookingNo::parse(no).unwrap(), zone, time.parse().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_is_cached_for_ttl() {
        let repo = Arc::new(MemoryRepository::with_content(SHEET.to_vec()));
        let store = store_over(repo.clone());

        let first = store.fetch().await.unwrap();
        assert_eq!(first.table.len(), 2);

        // Edited elsewhere; the cached copy is still served.
        let v = first.version.clone();
        repo.write(b"Booking_No,Zone,Time\nB9,Zone 1,10:00\n".to_vec(), v.as_ref())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.fetch().await.unwrap().table.len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = store.fetch().await.unwrap();
        assert_eq!(fresh.table.len(), 1);
        assert_eq!(fresh.table.bookings[0].booking_no.as_str(), "B9");
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_live_bypasses_cache() {
        let repo = Arc::new(MemoryRepository::with_content(SHEET.to_vec()));
        let store = store_over(repo.clone());
        let first = store.fetch().await.unwrap();
        repo.write(b"Booking_No,Zone,Time\n".to_vec(), first.version.as_ref())
            .await
            .unwrap();
        assert!(store.fetch_live().await.unwrap().table.is_empty());
        // and refreshed the cache
        assert!(store.fetch().await.unwrap().table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn commit_is_visible_to_next_fetch() {
        let repo = Arc::new(MemoryRepository::with_content(SHEET.to_vec()));
        let store = store_over(repo);
        let mut view = store.fetch().await.unwrap();
        view.table.bookings[1].bay = Some("Bay 2".into());

        let v2 = store.commit(&view.table, view.version.as_ref()).await.unwrap();
        let after = store.fetch().await.unwrap();
        assert_eq!(after.version, Some(v2));
        assert_eq!(after.table, view.table);
    }

    #[tokio::test]
    async fn stale_commit_conflicts() {
        let repo = Arc::new(MemoryRepository::with_content(SHEET.to_vec()));
        let store = store_over(repo.clone());

        let a = store.fetch_live().await.unwrap();
        let b = store.fetch_live().await.unwrap();

        let mut ta = a.table.clone();
        ta.bookings.push(booking("B3", "Zone 2", "10:00"));
        store.commit(&ta, a.version.as_ref()).await.unwrap();

        let mut tb = b.table.clone();
        tb.bookings[0].status = Status::Completed;
        let err = store.commit(&tb, b.version.as_ref()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let now = store.fetch().await.unwrap();
        assert_eq!(now.table, ta);
    }

    #[tokio::test]
    async fn missing_file_is_empty_and_creatable() {
        let repo = Arc::new(MemoryRepository::new());
        let store = store_over(repo.clone());
        let view = store.fetch().await.unwrap();
        assert!(view.table.is_empty());
        assert_eq!(view.version, None);

        let table = Table::new(vec![booking("B1", "Zone 1", "08:00")]);
        store.commit(&table, None).await.unwrap();
        assert_eq!(store.fetch().await.unwrap().table, table);
        assert!(String::from_utf8(repo.read().await.unwrap().unwrap().content)
            .unwrap()
            .starts_with("Booking_No,Zone,Bay,Time,Status\n"));
    }

    #[tokio::test]
    async fn malformed_and_unavailable_surface() {
        let repo = Arc::new(MemoryRepository::with_content(b"Zone,Time\nZone 1,09:00\n".to_vec()));
        let store = store_over(repo.clone());
        assert!(matches!(store.fetch().await, Err(StoreError::Malformed(_))));

        repo.set_unavailable(true);
        assert!(matches!(store.fetch().await, Err(StoreError::Unavailable(_))));
        let err = store.commit(&Table::default(), None).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn json_codec_round_trips_through_store() {
        let repo = Arc::new(MemoryRepository::new());
        let store = ScheduleStore::new(repo, Arc::new(JsonCodec), Duration::ZERO);
        let table = Table::new(vec![
            booking("B1", "Zone 1", "08:00").with_bay(1).with_status(Status::Arrived),
            booking("B2", "Zone 3", "08:15"),
        ]);
        store.commit(&table, None).await.unwrap();
        assert_eq!(store.fetch().await.unwrap().table, table);
    }
}
