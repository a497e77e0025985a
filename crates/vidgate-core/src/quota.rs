//! Daily quota accounting.
//!
//! Every check and commit goes through one critical section per process
//! ([`QuotaLedger`]) and, across processes, through a versioned
//! compare-and-swap on the persisted [`QuotaState`] ([`QuotaStore`]).

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;
use time::Time;
use vidgate_store::{LedgerStore, QuotaRecord, StoreError};

use crate::domain::{OperationType, UtcDateTime};
use crate::ApiError;

const MAX_CAS_ATTEMPTS: usize = 5;

/// Daily unit budget and its usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaState {
    pub used_units: u64,
    pub daily_budget: u64,
    pub reset_at: UtcDateTime,
}

impl QuotaState {
    pub fn new(daily_budget: u64, reset_at: UtcDateTime) -> Self {
        Self {
            used_units: 0,
            daily_budget,
            reset_at,
        }
    }

    pub const fn remaining(&self) -> u64 {
        self.daily_budget.saturating_sub(self.used_units)
    }

    /// Zero usage and advance `reset_at` one day per crossing until it lies
    /// in the future. Returns whether a reset happened.
    pub fn roll_over(&mut self, now: UtcDateTime) -> bool {
        let mut crossed = false;
        while now >= self.reset_at {
            self.reset_at = self.reset_at.saturating_add(time::Duration::DAY);
            crossed = true;
        }
        if crossed {
            self.used_units = 0;
        }
        crossed
    }
}

/// Wall-clock UTC time of day at which the budget resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyReset(Time);

impl DailyReset {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        Time::from_hms(hour, minute, 0).ok().map(Self)
    }

    /// Parse `HH:MM`.
    pub fn parse(value: &str) -> Option<Self> {
        let (hour, minute) = value.trim().split_once(':')?;
        if hour.len() != 2 || minute.len() != 2 {
            return None;
        }
        Self::new(hour.parse().ok()?, minute.parse().ok()?)
    }

    /// First reset instant strictly after `now`.
    pub fn next_after(self, now: UtcDateTime) -> UtcDateTime {
        let now_inner = now.into_inner();
        let candidate = now_inner.replace_time(self.0);
        let candidate = if candidate > now_inner {
            candidate
        } else {
            candidate.saturating_add(time::Duration::DAY)
        };
        UtcDateTime::from_offset_datetime(candidate).unwrap_or(now)
    }
}

impl Default for DailyReset {
    fn default() -> Self {
        Self(Time::from_hms(8, 0, 0).unwrap_or(Time::MIDNIGHT))
    }
}

/// Unit cost of each operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCostTable {
    pub search: u64,
    pub per_resource: u64,
    pub playlist_page: u64,
}

impl Default for QuotaCostTable {
    fn default() -> Self {
        Self {
            search: 100,
            per_resource: 1,
            playlist_page: 1,
        }
    }
}

impl QuotaCostTable {
    /// Units charged for an operation touching `resource_count` resources.
    pub fn cost(&self, operation: OperationType, resource_count: usize) -> u64 {
        let count = resource_count as u64;
        match operation {
            OperationType::Search => self.search,
            OperationType::PlaylistItems => self.playlist_page,
            OperationType::VideoDetails
            | OperationType::ChannelDetails
            | OperationType::VideoStats => self.per_resource.saturating_mul(count),
        }
    }
}

/// Point-in-time quota view for introspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaSnapshot {
    pub used: u64,
    pub budget: u64,
    pub remaining: u64,
    pub reserved: u64,
    pub reset_at: UtcDateTime,
    pub percentage_used: f64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("quota exhausted: requested {requested} units, {remaining} available until {reset_at}")]
    Exhausted {
        requested: u64,
        remaining: u64,
        reset_at: UtcDateTime,
    },
    #[error("refusing to commit {requested} units with only {remaining} remaining")]
    Overcommit { requested: u64, remaining: u64 },
    #[error("quota store error: {0}")]
    Store(String),
    #[error("quota state changed concurrently {attempts} times in a row")]
    Contention { attempts: usize },
}

impl QuotaError {
    /// Caller-facing form; exhaustion carries a hint of when to come back.
    pub fn to_api_error(&self, now: UtcDateTime) -> ApiError {
        match self {
            Self::Exhausted { reset_at, .. } => {
                let wait = reset_at.into_inner() - now.into_inner();
                let error = ApiError::quota_exceeded(self.to_string());
                match u64::try_from(wait.whole_seconds()) {
                    Ok(seconds) if seconds > 0 => {
                        error.with_retry_after(std::time::Duration::from_secs(seconds))
                    }
                    _ => error,
                }
            }
            Self::Overcommit { .. } => ApiError::quota_exceeded(self.to_string()),
            Self::Store(_) | Self::Contention { .. } => ApiError::internal(self.to_string()),
        }
    }
}

impl From<StoreError> for QuotaError {
    fn from(error: StoreError) -> Self {
        Self::Store(error.to_string())
    }
}

/// Persisted quota row plus its optimistic-concurrency version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredQuota {
    pub state: QuotaState,
    pub version: u64,
}

/// Externally persisted quota state.
pub trait QuotaStore: Send + Sync {
    fn load(&self) -> Result<Option<StoredQuota>, QuotaError>;

    /// Replace the state if its version still equals `expected_version`
    /// (`None` = nothing stored yet). Returns the new version, or `None` when
    /// another writer won.
    fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        next: &QuotaState,
    ) -> Result<Option<u64>, QuotaError>;
}

/// Process-local store, also used to simulate several processes in tests.
#[derive(Debug, Default)]
pub struct InMemoryQuotaStore {
    slot: Mutex<Option<StoredQuota>>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuotaStore for InMemoryQuotaStore {
    fn load(&self) -> Result<Option<StoredQuota>, QuotaError> {
        Ok(*self
            .slot
            .lock()
            .expect("quota store mutex should not be poisoned"))
    }

    fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        next: &QuotaState,
    ) -> Result<Option<u64>, QuotaError> {
        let mut slot = self
            .slot
            .lock()
            .expect("quota store mutex should not be poisoned");
        let current = slot.map(|stored| stored.version);
        if current != expected_version {
            return Ok(None);
        }
        let version = current.map_or(1, |version| version + 1);
        *slot = Some(StoredQuota {
            state: *next,
            version,
        });
        Ok(Some(version))
    }
}

/// Quota state persisted in the DuckDB `quota_state` table.
#[derive(Clone)]
pub struct PersistentQuotaStore {
    store: LedgerStore,
    ledger_id: String,
}

impl PersistentQuotaStore {
    pub fn new(store: LedgerStore, ledger_id: impl Into<String>) -> Self {
        Self {
            store,
            ledger_id: ledger_id.into(),
        }
    }
}

impl QuotaStore for PersistentQuotaStore {
    fn load(&self) -> Result<Option<StoredQuota>, QuotaError> {
        let Some(record) = self.store.load_quota(&self.ledger_id)? else {
            return Ok(None);
        };
        let reset_at = UtcDateTime::from_unix_timestamp(record.reset_at_unix).ok_or_else(|| {
            QuotaError::Store(format!("invalid reset instant {}", record.reset_at_unix))
        })?;
        Ok(Some(StoredQuota {
            state: QuotaState {
                used_units: u64::try_from(record.used_units).unwrap_or(0),
                daily_budget: u64::try_from(record.daily_budget).unwrap_or(0),
                reset_at,
            },
            version: u64::try_from(record.version).unwrap_or(0),
        }))
    }

    fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        next: &QuotaState,
    ) -> Result<Option<u64>, QuotaError> {
        let record = QuotaRecord {
            used_units: i64::try_from(next.used_units).unwrap_or(i64::MAX),
            daily_budget: i64::try_from(next.daily_budget).unwrap_or(i64::MAX),
            reset_at_unix: next.reset_at.unix_timestamp(),
            version: 0,
        };
        let expected = expected_version.map(|version| i64::try_from(version).unwrap_or(i64::MAX));
        let applied = self
            .store
            .compare_and_swap_quota(&self.ledger_id, expected, &record)?;
        Ok(applied.and_then(|version| u64::try_from(version).ok()))
    }
}

struct LedgerInner {
    state: QuotaState,
    version: Option<u64>,
    /// Units held by in-flight reservations of this process.
    reserved: u64,
}

/// Serialized gate over the daily budget.
pub struct QuotaLedger {
    inner: Mutex<LedgerInner>,
    store: Arc<dyn QuotaStore>,
    daily_budget: u64,
}

impl QuotaLedger {
    /// Open a ledger over `store`, seeding it when nothing is persisted yet.
    ///
    /// The configured budget overrides whatever budget the store carries.
    pub fn open(
        daily_budget: u64,
        reset: DailyReset,
        store: Arc<dyn QuotaStore>,
    ) -> Result<Self, QuotaError> {
        let now = UtcDateTime::now();
        let (state, version) = match store.load()? {
            Some(stored) => (
                QuotaState {
                    daily_budget,
                    ..stored.state
                },
                Some(stored.version),
            ),
            None => (QuotaState::new(daily_budget, reset.next_after(now)), None),
        };

        Ok(Self {
            inner: Mutex::new(LedgerInner {
                state,
                version,
                reserved: 0,
            }),
            store,
            daily_budget,
        })
    }

    pub fn in_memory(daily_budget: u64, reset: DailyReset) -> Self {
        Self::from_state(QuotaState::new(
            daily_budget,
            reset.next_after(UtcDateTime::now()),
        ))
    }

    /// Ledger with a fixed starting state over a fresh in-memory store.
    pub fn from_state(state: QuotaState) -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                state,
                version: None,
                reserved: 0,
            }),
            store: Arc::new(InMemoryQuotaStore::new()),
            daily_budget: state.daily_budget,
        }
    }

    /// Whether `cost` more units fit: `used + reserved + cost <= budget`.
    pub fn has_capacity(&self, cost: u64) -> bool {
        self.has_capacity_at(cost, UtcDateTime::now())
    }

    pub fn has_capacity_at(&self, cost: u64, now: UtcDateTime) -> bool {
        let mut inner = self.lock();
        if let Err(error) = self.refresh_locked(&mut inner, now) {
            tracing::warn!(%error, "quota store unavailable; refusing capacity");
            return false;
        }
        fits(&inner, cost)
    }

    /// Hold `cost` units for an in-flight call.
    pub fn reserve(self: &Arc<Self>, cost: u64) -> Result<QuotaReservation, QuotaError> {
        self.reserve_at(cost, UtcDateTime::now())
    }

    pub fn reserve_at(
        self: &Arc<Self>,
        cost: u64,
        now: UtcDateTime,
    ) -> Result<QuotaReservation, QuotaError> {
        let mut inner = self.lock();
        self.refresh_locked(&mut inner, now)?;
        if !fits(&inner, cost) {
            return Err(QuotaError::Exhausted {
                requested: cost,
                remaining: available(&inner),
                reset_at: inner.state.reset_at,
            });
        }
        inner.reserved += cost;
        Ok(QuotaReservation {
            ledger: Arc::clone(self),
            units: cost,
            settled: false,
        })
    }

    /// Add `cost` to the used units after a successful upstream call.
    pub fn commit(&self, cost: u64) -> Result<QuotaSnapshot, QuotaError> {
        self.commit_at(cost, UtcDateTime::now())
    }

    pub fn commit_at(&self, cost: u64, now: UtcDateTime) -> Result<QuotaSnapshot, QuotaError> {
        let mut inner = self.lock();
        self.commit_locked(&mut inner, cost, now)
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        self.snapshot_at(UtcDateTime::now())
    }

    pub fn snapshot_at(&self, now: UtcDateTime) -> QuotaSnapshot {
        let mut inner = self.lock();
        if let Err(error) = self.refresh_locked(&mut inner, now) {
            tracing::warn!(%error, "quota store unavailable; reporting cached state");
        }
        snapshot_of(&inner)
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner
            .lock()
            .expect("quota ledger mutex should not be poisoned")
    }

    fn release(&self, units: u64) {
        let mut inner = self.lock();
        inner.reserved = inner.reserved.saturating_sub(units);
    }

    fn commit_reserved(&self, units: u64, now: UtcDateTime) -> Result<QuotaSnapshot, QuotaError> {
        let mut inner = self.lock();
        inner.reserved = inner.reserved.saturating_sub(units);
        self.commit_locked(&mut inner, units, now)
    }

    fn commit_locked(
        &self,
        inner: &mut LedgerInner,
        cost: u64,
        now: UtcDateTime,
    ) -> Result<QuotaSnapshot, QuotaError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            self.refresh_locked(inner, now)?;

            let remaining = inner.state.remaining();
            if cost > remaining {
                tracing::error!(
                    requested = cost,
                    remaining,
                    used = inner.state.used_units,
                    budget = inner.state.daily_budget,
                    "quota commit would exceed the daily budget"
                );
                return Err(QuotaError::Overcommit {
                    requested: cost,
                    remaining,
                });
            }

            let next = QuotaState {
                used_units: inner.state.used_units + cost,
                ..inner.state
            };
            if let Some(version) = self.store.compare_and_swap(inner.version, &next)? {
                inner.state = next;
                inner.version = Some(version);
                return Ok(snapshot_of(inner));
            }
            tracing::debug!("quota state changed underneath commit; reloading");
        }

        Err(QuotaError::Contention {
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Pull the latest persisted state and apply the daily reset rule.
    fn refresh_locked(&self, inner: &mut LedgerInner, now: UtcDateTime) -> Result<(), QuotaError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            if let Some(stored) = self.store.load()? {
                inner.state = QuotaState {
                    daily_budget: self.daily_budget,
                    ..stored.state
                };
                inner.version = Some(stored.version);
            }

            let mut next = inner.state;
            if !next.roll_over(now) {
                return Ok(());
            }

            if let Some(version) = self.store.compare_and_swap(inner.version, &next)? {
                tracing::info!(reset_at = %next.reset_at, "daily quota reset");
                inner.state = next;
                inner.version = Some(version);
                return Ok(());
            }
        }

        Err(QuotaError::Contention {
            attempts: MAX_CAS_ATTEMPTS,
        })
    }
}

fn available(inner: &LedgerInner) -> u64 {
    inner.state.remaining().saturating_sub(inner.reserved)
}

fn fits(inner: &LedgerInner, cost: u64) -> bool {
    inner
        .state
        .used_units
        .saturating_add(inner.reserved)
        .saturating_add(cost)
        <= inner.state.daily_budget
}

fn snapshot_of(inner: &LedgerInner) -> QuotaSnapshot {
    let state = inner.state;
    let percentage_used = if state.daily_budget == 0 {
        100.0
    } else {
        (state.used_units as f64 / state.daily_budget as f64) * 100.0
    };
    QuotaSnapshot {
        used: state.used_units,
        budget: state.daily_budget,
        remaining: state.remaining(),
        reserved: inner.reserved,
        reset_at: state.reset_at,
        percentage_used,
    }
}

/// Units held for one in-flight call; released on drop unless committed.
pub struct QuotaReservation {
    ledger: Arc<QuotaLedger>,
    units: u64,
    settled: bool,
}

impl QuotaReservation {
    pub const fn units(&self) -> u64 {
        self.units
    }

    /// Move the held units into used units.
    pub fn commit(self) -> Result<QuotaSnapshot, QuotaError> {
        self.commit_at(UtcDateTime::now())
    }

    pub fn commit_at(mut self, now: UtcDateTime) -> Result<QuotaSnapshot, QuotaError> {
        self.settled = true;
        self.ledger.commit_reserved(self.units, now)
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if !self.settled {
            self.ledger.release(self.units);
        }
    }
}

impl std::fmt::Debug for QuotaReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaReservation")
            .field("units", &self.units)
            .field("settled", &self.settled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(value: &str) -> UtcDateTime {
        UtcDateTime::parse(value).expect("timestamp")
    }

    fn ledger(used: u64, budget: u64) -> Arc<QuotaLedger> {
        Arc::new(QuotaLedger::from_state(QuotaState {
            used_units: used,
            daily_budget: budget,
            reset_at: at("2024-05-02T08:00:00Z"),
        }))
    }

    const NOW: &str = "2024-05-01T12:00:00Z";

    #[test]
    fn capacity_holds_exactly_when_usage_plus_cost_fits() {
        let cases = [
            (0, 100, 100),
            (50, 50, 100),
            (50, 51, 100),
            (100, 0, 100),
            (9_950, 100, 10_000),
        ];
        for (used, cost, budget) in cases {
            let ledger = ledger(used, budget);
            assert_eq!(
                ledger.has_capacity_at(cost, at(NOW)),
                used + cost <= budget,
                "used={used} cost={cost} budget={budget}"
            );
        }
    }

    #[test]
    fn commit_reduces_remaining_and_never_goes_negative() {
        let ledger = ledger(9_000, 10_000);
        let snapshot = ledger.commit_at(900, at(NOW)).expect("commit");
        assert_eq!(snapshot.remaining, 100);
        assert_eq!(snapshot.used, 9_900);

        let error = ledger.commit_at(101, at(NOW)).expect_err("overcommit");
        assert_eq!(
            error,
            QuotaError::Overcommit {
                requested: 101,
                remaining: 100
            }
        );
        assert_eq!(ledger.snapshot_at(at(NOW)).used, 9_900);
    }

    #[test]
    fn reset_happens_once_per_crossing() {
        let ledger = ledger(4_000, 10_000);

        let before = ledger.snapshot_at(at("2024-05-02T07:59:59Z"));
        assert_eq!(before.used, 4_000);

        let after = ledger.snapshot_at(at("2024-05-02T08:00:00Z"));
        assert_eq!(after.used, 0);
        assert_eq!(after.reset_at, at("2024-05-03T08:00:00Z"));

        ledger
            .commit_at(25, at("2024-05-02T08:00:01Z"))
            .expect("commit");
        let later = ledger.snapshot_at(at("2024-05-02T20:00:00Z"));
        assert_eq!(later.used, 25);
        assert_eq!(later.reset_at, at("2024-05-03T08:00:00Z"));
    }

    #[test]
    fn long_downtime_advances_reset_by_whole_days() {
        let mut state = QuotaState {
            used_units: 10,
            daily_budget: 100,
            reset_at: at("2024-05-02T08:00:00Z"),
        };
        assert!(state.roll_over(at("2024-05-05T09:30:00Z")));
        assert_eq!(state.used_units, 0);
        assert_eq!(state.reset_at, at("2024-05-06T08:00:00Z"));
        assert!(!state.roll_over(at("2024-05-05T10:00:00Z")));
    }

    #[test]
    fn reservations_hold_capacity_until_committed_or_dropped() {
        let ledger = ledger(0, 100);
        let reservation = ledger.reserve_at(60, at(NOW)).expect("reserve");
        assert!(!ledger.has_capacity_at(50, at(NOW)));
        assert!(ledger.reserve_at(50, at(NOW)).is_err());
        drop(reservation);
        assert!(ledger.has_capacity_at(100, at(NOW)));

        let reservation = ledger.reserve_at(60, at(NOW)).expect("reserve");
        let snapshot = reservation.commit_at(at(NOW)).expect("commit");
        assert_eq!(snapshot.used, 60);
        assert_eq!(snapshot.reserved, 0);
    }

    #[test]
    fn exhaustion_carries_time_until_reset() {
        let ledger = ledger(50, 100);
        let error = ledger.reserve_at(100, at(NOW)).expect_err("exhausted");
        let api_error = error.to_api_error(at(NOW));
        assert_eq!(api_error.code(), "quota.exceeded");
        assert_eq!(
            api_error.retry_after(),
            Some(std::time::Duration::from_secs(20 * 3_600))
        );
    }

    #[test]
    fn ledgers_sharing_a_store_cannot_overcommit() {
        let store: Arc<dyn QuotaStore> = Arc::new(InMemoryQuotaStore::new());
        let reset = DailyReset::default();
        let first = QuotaLedger::open(100, reset, Arc::clone(&store)).expect("open");
        let second = QuotaLedger::open(100, reset, Arc::clone(&store)).expect("open");

        first.commit(70).expect("first commit");
        assert!(!second.has_capacity(40));
        assert!(matches!(
            second.commit(40),
            Err(QuotaError::Overcommit { remaining: 30, .. })
        ));
        assert_eq!(second.commit(30).expect("fits").remaining, 0);
        assert_eq!(first.snapshot().used, 100);
    }

    struct AlwaysConflicting;

    impl QuotaStore for AlwaysConflicting {
        fn load(&self) -> Result<Option<StoredQuota>, QuotaError> {
            Ok(None)
        }

        fn compare_and_swap(
            &self,
            _expected_version: Option<u64>,
            _next: &QuotaState,
        ) -> Result<Option<u64>, QuotaError> {
            Ok(None)
        }
    }

    #[test]
    fn endless_conflicts_surface_as_contention() {
        let ledger = QuotaLedger::open(100, DailyReset::default(), Arc::new(AlwaysConflicting))
            .expect("open");
        assert_eq!(
            ledger.commit(1),
            Err(QuotaError::Contention {
                attempts: MAX_CAS_ATTEMPTS
            })
        );
    }

    #[test]
    fn daily_reset_parses_and_finds_next_instant() {
        let reset = DailyReset::parse("08:00").expect("parse");
        assert_eq!(
            reset.next_after(at("2024-05-01T07:00:00Z")),
            at("2024-05-01T08:00:00Z")
        );
        assert_eq!(
            reset.next_after(at("2024-05-01T08:00:00Z")),
            at("2024-05-02T08:00:00Z")
        );
        assert!(DailyReset::parse("25:00").is_none());
        assert!(DailyReset::parse("8am").is_none());
    }

    #[test]
    fn cost_table_charges_search_flat_and_lookups_per_id() {
        let table = QuotaCostTable::default();
        assert_eq!(table.cost(OperationType::Search, 1), 100);
        assert_eq!(table.cost(OperationType::VideoDetails, 7), 7);
        assert_eq!(table.cost(OperationType::VideoStats, 0), 0);
        assert_eq!(table.cost(OperationType::PlaylistItems, 1), 1);
    }

    #[test]
    fn persistent_store_round_trips_through_duckdb() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = LedgerStore::open(vidgate_store::StoreConfig::for_home(temp.path()))
            .expect("store");
        let quota_store: Arc<dyn QuotaStore> =
            Arc::new(PersistentQuotaStore::new(store.clone(), "default"));

        let ledger = QuotaLedger::open(1_000, DailyReset::default(), Arc::clone(&quota_store))
            .expect("open");
        ledger.commit(123).expect("commit");

        let reopened = QuotaLedger::open(
            1_000,
            DailyReset::default(),
            Arc::new(PersistentQuotaStore::new(store, "default")),
        )
        .expect("reopen");
        assert_eq!(reopened.snapshot().used, 123);
    }
}
