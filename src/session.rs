use std::sync::Arc;

use tracing::{info, warn};

use crate::auth::AuthorizationChecker;
use crate::config::ZoneConfig;
use crate::model::*;
use crate::observability;
use crate::store::{Fetched, ScheduleStore, VersionToken};
use crate::sync::{Committed, EditRow, Edits, SyncController};
use crate::yard::{self, FieldError, YardError, YardSnapshot};

/// Process-wide handles shared by all sessions. Holds no schedule data of
/// its own; the store is the only source of truth.
pub struct Yard {
    store: Arc<ScheduleStore>,
    zones: Arc<ZoneConfig>,
    sync: SyncController,
}

impl Yard {
    pub fn new(store: Arc<ScheduleStore>, zones: ZoneConfig) -> Self {
        let zones = Arc::new(zones);
        Self {
            sync: SyncController::new(store.clone(), zones.clone()),
            store,
            zones,
        }
    }

    pub fn zones(&self) -> &ZoneConfig {
        &self.zones
    }

    pub fn store(&self) -> &ScheduleStore {
        &self.store
    }

    pub fn open_session(self: &Arc<Self>, auth: Arc<dyn AuthorizationChecker>) -> Session {
        Session {
            yard: self.clone(),
            auth,
            view: None,
        }
    }
}

/// One client's view of the schedule. Each session keeps the table and
/// version token it last read; edits are committed against that token.
pub struct Session {
    yard: Arc<Yard>,
    auth: Arc<dyn AuthorizationChecker>,
    view: Option<Fetched>,
}

impl Session {
    pub fn is_privileged(&self) -> bool {
        self.auth.is_privileged()
    }

    pub fn zones(&self) -> &ZoneConfig {
        &self.yard.zones
    }

    /// Version the session's view was read at, if it has one.
    pub fn version(&self) -> Option<&VersionToken> {
        self.view.as_ref().and_then(|v| v.version.as_ref())
    }

    /// Re-read the table, through the store's cache.
    pub async fn refresh(&mut self) -> Result<&Table, YardError> {
        let fetched = self.yard.store.fetch().await?;
        Ok(&self.view.insert(fetched).table)
    }

    /// The session's current table, reading it on first use.
    pub async fn table(&mut self) -> Result<&Table, YardError> {
        if self.view.is_none() {
            self.refresh().await?;
        }
        self.view
            .as_ref()
            .map(|v| &v.table)
            .ok_or_else(|| YardError::StoreUnavailable("schedule not loaded".into()))
    }

    pub async fn snapshot(&mut self) -> Result<YardSnapshot, YardError> {
        let zones = self.yard.zones.clone();
        let table = self.table().await?;
        Ok(yard::snapshot(table, &zones))
    }

    pub async fn find(&mut self, booking_no: &str) -> Result<BookingView, YardError> {
        yard::find_by_booking_id(booking_no, self.table().await?)
    }

    /// Commit office edits against this session's view. On a conflict the
    /// view is reloaded so the caller can look again before retrying.
    pub async fn apply(&mut self, edits: Edits) -> Result<VersionToken, YardError> {
        self.require_office()?;
        self.table().await?;
        let Some(view) = self.view.as_ref() else {
            return Err(YardError::StoreUnavailable("schedule not loaded".into()));
        };
        let result = self.yard.sync.apply(self.auth.as_ref(), view, &edits).await;
        self.settle(result).await
    }

    /// Give a booking a bay in its zone. A booking that already holds a
    /// valid bay keeps it.
    pub async fn assign_bay(&mut self, booking_no: &str) -> Result<BayRef, YardError> {
        self.require_office()?;
        // Decide on the live table, not a cached one: the slot must still be free.
        let live = self.yard.store.fetch_live().await?;
        let booking = active_booking(&live.table, booking_no)?.clone();

        if let Some(number) = booking.bay_number()
            && let Some((spec, _)) = self
                .yard
                .zones
                .resolve_bay(&booking.zone, &bay_label(number))
        {
            self.view = Some(live);
            return Ok(BayRef {
                zone: spec.name.clone(),
                number,
            });
        }

        let board = yard::snapshot(&live.table, &self.yard.zones);
        let bay = match yard::assign(&booking, &self.yard.zones, &board) {
            Ok(bay) => bay,
            Err(e) => {
                if let YardError::ZoneFull { zone } = &e {
                    metrics::counter!(observability::ZONE_FULL_TOTAL).increment(1);
                    warn!(booking_no = %booking.booking_no, %zone, "no free bay");
                }
                self.view = Some(live);
                return Err(e);
            }
        };

        let edits = Edits::Upsert(vec![
            EditRow::new(booking.booking_no.as_str())
                .zone(bay.zone.clone())
                .bay(bay.label()),
        ]);
        let result = self.yard.sync.apply(self.auth.as_ref(), &live, &edits).await;
        self.view = Some(live);
        self.settle(result).await?;
        info!(booking_no = %booking.booking_no, bay = %bay, "bay assigned");
        Ok(bay)
    }

    /// Move an active booking to `status`, following the status rules.
    pub async fn set_status(
        &mut self,
        booking_no: &str,
        status: Status,
    ) -> Result<BookingView, YardError> {
        self.require_office()?;
        let live = self.yard.store.fetch_live().await?;
        let booking = active_booking(&live.table, booking_no)?;
        let edits = Edits::Upsert(vec![
            EditRow::new(booking.booking_no.as_str()).status(status.as_str()),
        ]);
        let number = booking.booking_no.clone();
        // The upsert rewrites the active row in place, so its index is stable.
        let position = live.table.position(booking_no);
        let result = self.yard.sync.apply(self.auth.as_ref(), &live, &edits).await;
        self.view = Some(live);
        self.settle(result).await?;

        let table = self.table().await?;
        let updated = position
            .and_then(|p| table.bookings.get(p))
            .ok_or_else(|| YardError::NotFound(number.to_string()))?;
        Ok(BookingView::from(updated))
    }

    /// Free the booking's bay by completing it. The row stays in the table.
    pub async fn release(&mut self, booking_no: &str) -> Result<BookingView, YardError> {
        self.set_status(booking_no, Status::Completed).await
    }

    fn require_office(&self) -> Result<(), YardError> {
        if self.auth.is_privileged() {
            return Ok(());
        }
        metrics::counter!(observability::UNAUTHORIZED_TOTAL).increment(1);
        warn!("rejected schedule change without office access");
        Err(YardError::Unauthorized)
    }

    /// Adopt the committed table, or reload after losing a race.
    async fn settle(
        &mut self,
        result: Result<Committed, YardError>,
    ) -> Result<VersionToken, YardError> {
        match result {
            Ok(committed) => {
                self.view = Some(Fetched {
                    table: committed.table,
                    version: Some(committed.version.clone()),
                    fetched_at: tokio::time::Instant::now(),
                });
                Ok(committed.version)
            }
            Err(e @ YardError::Conflict { .. }) => {
                if let Ok(fresh) = self.yard.store.fetch_live().await {
                    self.view = Some(fresh);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

fn active_booking<'a>(table: &'a Table, booking_no: &str) -> Result<&'a Booking, YardError> {
    match table.get(booking_no) {
        Some(b) if b.is_active() => Ok(b),
        Some(b) => Err(YardError::invalid(
            FieldError::new("booking is already completed")
                .for_booking(b.booking_no.as_str())
                .in_column(Column::Status),
        )),
        None => Err(YardError::NotFound(booking_no.trim().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::Role;
    use crate::config::ZoneSpec;
    use crate::store::{CsvCodec, MemoryRepository, RemoteRepository};

    const SHEET: &str = "Booking_No,Zone,Bay,Time,Status\n\
        B1,Zone A,,09:00,Expected\n\
        B2,Zone A,,09:30,Expected\n\
        B3,Zone A,,10:00,Expected\n\
        B4,Zone A,,10:30,Expected\n";

    fn yard_over(repo: Arc<MemoryRepository>) -> Arc<Yard> {
        let store = ScheduleStore::new(repo, Arc::new(CsvCodec), Duration::from_secs(3));
        let zones = ZoneConfig::new(vec![ZoneSpec {
            name: "Zone A".into(),
            bays: 2,
        }])
        .unwrap();
        Arc::new(Yard::new(Arc::new(store), zones))
    }

    fn setup() -> (Arc<MemoryRepository>, Arc<Yard>) {
        let repo = Arc::new(MemoryRepository::with_content(SHEET.as_bytes().to_vec()));
        let yard = yard_over(repo.clone());
        (repo, yard)
    }

    fn office(yard: &Arc<Yard>) -> Session {
        yard.open_session(Arc::new(Role::Office))
    }

    #[tokio::test]
    async fn assign_walks_the_zone_then_reports_full() {
        let (_, yard) = setup();
        let mut s = office(&yard);
        assert_eq!(s.assign_bay("B1").await.unwrap().number, 1);
        assert_eq!(s.assign_bay("b2").await.unwrap().number, 2);
        assert_eq!(
            s.assign_bay("B3").await.unwrap_err(),
            YardError::ZoneFull { zone: "Zone A".into() }
        );

        let board = s.snapshot().await.unwrap();
        assert_eq!(board.bay("Zone A", 1).unwrap().current().unwrap().booking_no.as_str(), "B1");
        assert_eq!(board.unassigned.len(), 2);
    }

    #[tokio::test]
    async fn assign_is_stable_for_placed_booking() {
        let (repo, yard) = setup();
        let mut s = office(&yard);
        s.assign_bay("B1").await.unwrap();
        let version = repo.current_version().await.unwrap();
        assert_eq!(s.assign_bay("B1").await.unwrap().number, 1);
        assert_eq!(repo.current_version().await.unwrap(), version);
    }

    #[tokio::test]
    async fn set_status_reports_the_row_it_changed() {
        let sheet = "Booking_No,Zone,Bay,Time,Status\n\
            B1,Zone A,,09:00,Expected\n\
            B1,Zone A,Bay 2,07:00,Completed\n";
        let yard = yard_over(Arc::new(MemoryRepository::with_content(sheet.as_bytes().to_vec())));
        let mut s = office(&yard);
        let view = s.set_status("b1", Status::Arrived).await.unwrap();
        assert_eq!(view.status, Status::Arrived);
        assert_eq!(view.time.to_string(), "09:00");
        assert_eq!(view.bay, None);
    }

    #[tokio::test]
    async fn release_frees_the_bay() {
        let (_, yard) = setup();
        let mut s = office(&yard);
        s.assign_bay("B1").await.unwrap();
        s.assign_bay("B2").await.unwrap();

        s.set_status("B1", Status::Arrived).await.unwrap();
        let released = s.release("B1").await.unwrap();
        assert_eq!(released.status, Status::Completed);
        assert_eq!(s.assign_bay("B4").await.unwrap().number, 1);

        // History stays in the table.
        let view = s.find("B1").await.unwrap();
        assert_eq!(view.status, Status::Completed);
        assert!(matches!(s.assign_bay("B1").await, Err(YardError::Validation(_))));
    }

    #[tokio::test]
    async fn release_needs_arrival_first() {
        let (_, yard) = setup();
        let mut s = office(&yard);
        assert!(matches!(s.release("B1").await, Err(YardError::Validation(_))));
        assert!(matches!(s.release("B99").await, Err(YardError::NotFound(_))));
    }

    #[tokio::test]
    async fn viewer_cannot_mutate() {
        let (repo, yard) = setup();
        let before = repo.current_version().await.unwrap();
        let mut s = yard.open_session(Arc::new(Role::Viewer));
        assert_eq!(s.assign_bay("B1").await.unwrap_err(), YardError::Unauthorized);
        assert_eq!(s.release("B1").await.unwrap_err(), YardError::Unauthorized);
        assert_eq!(
            s.apply(Edits::Remove(vec!["B1".into()])).await.unwrap_err(),
            YardError::Unauthorized
        );
        assert_eq!(repo.current_version().await.unwrap(), before);

        // Reads are fine.
        assert_eq!(s.find("B1").await.unwrap().zone, "Zone A");
    }

    #[tokio::test]
    async fn sessions_conflict_then_recover() {
        let (_, yard) = setup();
        let mut a = office(&yard);
        let mut b = office(&yard);
        a.refresh().await.unwrap();
        b.refresh().await.unwrap();
        assert_eq!(a.version(), b.version());

        a.apply(Edits::Upsert(vec![EditRow::new("B1").bay("Bay 2")]))
            .await
            .unwrap();
        let err = b
            .apply(Edits::Upsert(vec![EditRow::new("B2").bay("Bay 2")]))
            .await
            .unwrap_err();
        assert!(matches!(err, YardError::Conflict { .. }));

        // b was reloaded and now sees a's edit.
        assert_eq!(b.version(), a.version());
        assert_eq!(b.find("B1").await.unwrap().bay.as_deref(), Some("Bay 2"));
        b.apply(Edits::Upsert(vec![EditRow::new("B2").bay("Bay 1")]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn targeted_changes_use_live_table() {
        let (repo, yard) = setup();
        let mut s = office(&yard);
        s.refresh().await.unwrap();

        // Someone else fills Bay 1 behind the session's back.
        let current = repo.current_version().await.unwrap();
        let edited = SHEET.replace("B3,Zone A,,", "B3,Zone A,Bay 1,");
        repo.write(edited.into_bytes(), current.as_ref()).await.unwrap();

        // The cached view still says Bay 1 is free; assignment must not use it.
        assert_eq!(s.assign_bay("B1").await.unwrap().number, 2);
    }

    #[tokio::test]
    async fn store_outage_is_reported() {
        let (repo, yard) = setup();
        let mut s = office(&yard);
        repo.set_unavailable(true);
        assert!(matches!(s.snapshot().await, Err(YardError::StoreUnavailable(_))));
        assert!(matches!(s.assign_bay("B1").await, Err(YardError::StoreUnavailable(_))));
    }
}
