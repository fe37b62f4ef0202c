//! Rx/Tx bandwidth aggregator (C8): buckets bytes sent/received per
//! peer host into fixed-width time windows, the way the original
//! source's `rxtx::Buckets<intervalSeconds>` rounds every transmission
//! event up to the bucket it falls in and finalizes closed buckets on
//! request. Closed windows are durable: `RxTxStore` mirrors the
//! original's persistent `hosts`/`hours`/`minutes` tables so history
//! survives a node restart.

use redb::{ReadableTableMetadata, TableDefinition};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs()
}

fn ceil_to(seconds: u64, interval: u64) -> u64 {
    seconds.div_ceil(interval) * interval
}

fn floor_to(seconds: u64, interval: u64) -> u64 {
    (seconds / interval) * interval
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Transmitted {
    pub rx: u64,
    pub tx: u64,
}

/// A single closed or in-progress window, identified by its end time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxTxSnapshot {
    pub begin_unix: u64,
    pub end_unix: u64,
    pub rx: u64,
    pub tx: u64,
}

struct Bucket {
    end_unix: u64,
    current: Transmitted,
    closed: Vec<RxTxSnapshot>,
}

impl Bucket {
    fn new(end_unix: u64) -> Self {
        Bucket { end_unix, current: Transmitted::default(), closed: Vec::new() }
    }

    fn snapshot(&self, interval: u64) -> RxTxSnapshot {
        RxTxSnapshot { begin_unix: self.end_unix.saturating_sub(interval), end_unix: self.end_unix, rx: self.current.rx, tx: self.current.tx }
    }
}

/// Default retention window for closed history rows, matching the
/// original aggregator's once-an-hour pruning pass.
pub const DEFAULT_RETENTION_SECS: u64 = 30 * 24 * 3600;

/// Per-peer byte counters bucketed into fixed `interval_secs` windows.
pub struct RxTxAggregator {
    interval_secs: u64,
    buckets: HashMap<String, Bucket>,
    last_finalize: u64,
    history: HashMap<String, Vec<RxTxSnapshot>>,
}

impl RxTxAggregator {
    pub fn new(interval_secs: u64) -> Self {
        assert!(interval_secs > 0, "interval must be positive");
        RxTxAggregator { interval_secs, buckets: HashMap::new(), last_finalize: 0, history: HashMap::new() }
    }

    pub fn minute() -> Self {
        RxTxAggregator::new(60)
    }

    pub fn hour() -> Self {
        RxTxAggregator::new(3600)
    }

    /// Records one transmission event for `peer_host`, rolling its
    /// current bucket into `closed` history if the event lands in a
    /// later window.
    pub fn record(&mut self, peer_host: &str, n_bytes: u64, is_rx: bool, at: SystemTime) {
        let end = ceil_to(unix_seconds(at), self.interval_secs);
        let bucket = self.buckets.entry(peer_host.to_string()).or_insert_with(|| Bucket::new(end));
        if bucket.end_unix < end {
            bucket.closed.push(bucket.snapshot(self.interval_secs));
            bucket.end_unix = end;
            bucket.current = Transmitted::default();
        }
        if is_rx {
            bucket.current.rx += n_bytes;
        } else {
            bucket.current.tx += n_bytes;
        }
    }

    /// Closes and drains every bucket whose window has fully elapsed as
    /// of `at`, or every bucket unconditionally when `drain` is set
    /// (e.g. on shutdown). Returns `(peer_host, windows)` pairs; a peer
    /// with no newly-closed window since the last call is omitted
    /// unless `drain` forces it out.
    pub fn finalize_all(&mut self, at: SystemTime, drain: bool) -> Vec<(String, Vec<RxTxSnapshot>)> {
        let threshold = floor_to(unix_seconds(at), self.interval_secs);
        if drain {
            if self.last_finalize >= threshold && !self.buckets.is_empty() {
                // still drain on explicit shutdown even if the clock hasn't advanced
            }
        } else {
            if self.last_finalize >= threshold {
                return Vec::new();
            }
            self.last_finalize = threshold;
        }

        let mut out = Vec::new();
        let hosts: Vec<String> = self.buckets.keys().cloned().collect();
        for host in hosts {
            let should_close = drain || self.buckets[&host].end_unix <= threshold;
            if should_close {
                let mut bucket = self.buckets.remove(&host).unwrap();
                bucket.closed.push(bucket.snapshot(self.interval_secs));
                self.history.entry(host.clone()).or_default().extend(bucket.closed.iter().copied());
                out.push((host, bucket.closed));
            } else {
                let bucket = self.buckets.get_mut(&host).unwrap();
                if !bucket.closed.is_empty() {
                    let rows = std::mem::take(&mut bucket.closed);
                    self.history.entry(host.clone()).or_default().extend(rows.iter().copied());
                    out.push((host, rows));
                }
            }
        }
        out
    }

    /// Drops history rows whose window ended more than `retention_secs`
    /// before `at`. Call roughly once an hour; a no-op between prunes is
    /// cheap since it's bounded by the number of tracked peers.
    pub fn prune_older_than(&mut self, at: SystemTime, retention_secs: u64) {
        let cutoff = unix_seconds(at).saturating_sub(retention_secs);
        self.history.retain(|_, rows| {
            rows.retain(|r| r.end_unix >= cutoff);
            !rows.is_empty()
        });
    }

    /// Closed history for `peer_host` with the still-open current window
    /// appended on top, so callers see up-to-the-moment totals without
    /// waiting for the next `finalize_all`.
    pub fn get_aggregated(&self, peer_host: &str) -> Vec<RxTxSnapshot> {
        let mut rows = self.history.get(peer_host).cloned().unwrap_or_default();
        if let Some(bucket) = self.buckets.get(peer_host) {
            rows.push(bucket.snapshot(self.interval_secs));
        }
        rows
    }

    /// Current (possibly still-open) window for every tracked peer,
    /// merged so repeated calls within the same window accumulate
    /// rather than duplicate.
    pub fn current_snapshot(&self) -> HashMap<String, RxTxSnapshot> {
        self.buckets.iter().map(|(host, b)| (host.clone(), b.snapshot(self.interval_secs))).collect()
    }

    pub fn tracked_peers(&self) -> usize {
        self.buckets.len()
    }

    /// Same as `finalize_all`, but persists every newly-closed window to
    /// `store` under `granularity`. Rows already moved into in-memory
    /// `history` by `finalize_all` stay there even if a write fails
    /// partway through a peer's window list; the error surfaces to the
    /// caller so it can retry the persist without losing the in-memory
    /// record of what closed.
    pub fn finalize_and_persist(
        &mut self,
        at: SystemTime,
        drain: bool,
        store: &RxTxStore,
        granularity: Granularity,
    ) -> Result<Vec<(String, Vec<RxTxSnapshot>)>, RxTxError> {
        let closed = self.finalize_all(at, drain);
        for (host, windows) in &closed {
            store.persist_all(granularity, host, windows)?;
        }
        Ok(closed)
    }

    /// `get_aggregated`, but with `store`'s persisted rows for `peer_host`
    /// spliced in underneath the in-memory history and open bucket. Rows
    /// already present in memory are not duplicated: a window is only
    /// pulled from disk if its `end_unix` isn't already covered.
    pub fn get_aggregated_with_store(&self, peer_host: &str, store: &RxTxStore, granularity: Granularity) -> Result<Vec<RxTxSnapshot>, RxTxError> {
        let in_memory = self.get_aggregated(peer_host);
        let known_ends: std::collections::HashSet<u64> = in_memory.iter().map(|w| w.end_unix).collect();

        let mut persisted = store.load(granularity, peer_host, self.interval_secs)?;
        persisted.retain(|w| !known_ends.contains(&w.end_unix));

        persisted.extend(in_memory);
        persisted.sort_by_key(|w| w.end_unix);
        Ok(persisted)
    }
}

/// Which of the two persisted granularities a window belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Granularity {
    Minute,
    Hour,
}

const HOSTS_TABLE: TableDefinition<&str, u32> = TableDefinition::new("hosts");
const MINUTES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("minutes");
const HOURS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("hours");

fn window_key(host_id: u32, end_unix: u64) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(&host_id.to_be_bytes());
    key[4..].copy_from_slice(&end_unix.to_be_bytes());
    key
}

fn window_value(rx: u64, tx: u64) -> [u8; 16] {
    let mut value = [0u8; 16];
    value[..8].copy_from_slice(&rx.to_be_bytes());
    value[8..].copy_from_slice(&tx.to_be_bytes());
    value
}

/// redb-backed durability for closed `RxTxAggregator` windows, keyed by
/// an interned host id so the hot path never re-writes a host string.
/// Mirrors the original's `hosts` interning table plus one table per
/// tracked granularity (`hours`, `minutes`).
pub struct RxTxStore {
    db: redb::Database,
}

impl RxTxStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RxTxError> {
        let db = redb::Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(HOSTS_TABLE)?;
            let _ = write_txn.open_table(MINUTES_TABLE)?;
            let _ = write_txn.open_table(HOURS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(RxTxStore { db })
    }

    fn host_id(&self, host: &str) -> Result<u32, RxTxError> {
        {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(HOSTS_TABLE)?;
            if let Some(id) = table.get(host)? {
                return Ok(id.value());
            }
        }
        let write_txn = self.db.begin_write()?;
        let id = {
            let mut table = write_txn.open_table(HOSTS_TABLE)?;
            let next = table.len()? as u32 + 1;
            table.insert(host, next)?;
            next
        };
        write_txn.commit()?;
        Ok(id)
    }

    fn table_for(granularity: Granularity) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
        match granularity {
            Granularity::Minute => MINUTES_TABLE,
            Granularity::Hour => HOURS_TABLE,
        }
    }

    /// Persists one closed window for `peer_host`, overwriting any row
    /// already stored for that exact `end_unix` (a re-finalize of the
    /// same window is idempotent, not duplicated).
    pub fn persist(&self, granularity: Granularity, peer_host: &str, window: &RxTxSnapshot) -> Result<(), RxTxError> {
        let host_id = self.host_id(peer_host)?;
        let key = window_key(host_id, window.end_unix);
        let value = window_value(window.rx, window.tx);

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(Self::table_for(granularity))?;
            table.insert(key.as_slice(), value.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Persists every window `finalize_all` just closed for one peer.
    pub fn persist_all(&self, granularity: Granularity, peer_host: &str, windows: &[RxTxSnapshot]) -> Result<(), RxTxError> {
        for window in windows {
            self.persist(granularity, peer_host, window)?;
        }
        Ok(())
    }

    /// Loads every persisted window for `peer_host`, oldest first.
    pub fn load(&self, granularity: Granularity, peer_host: &str, interval_secs: u64) -> Result<Vec<RxTxSnapshot>, RxTxError> {
        let host_id = self.host_id(peer_host)?;
        let start = window_key(host_id, 0);
        let end = window_key(host_id, u64::MAX);

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(Self::table_for(granularity))?;
        let mut out = Vec::new();
        for row in table.range(start.as_slice()..=end.as_slice())? {
            let (k, v) = row?;
            let end_unix = u64::from_be_bytes(k.value()[4..12].try_into().unwrap());
            let rx = u64::from_be_bytes(v.value()[0..8].try_into().unwrap());
            let tx = u64::from_be_bytes(v.value()[8..16].try_into().unwrap());
            out.push(RxTxSnapshot { begin_unix: end_unix.saturating_sub(interval_secs), end_unix, rx, tx });
        }
        Ok(out)
    }
}

#[derive(Debug)]
pub enum RxTxError {
    Database(redb::DatabaseError),
    Storage(redb::StorageError),
    Table(redb::TableError),
    Commit(redb::CommitError),
    Transaction(redb::TransactionError),
}

impl From<redb::DatabaseError> for RxTxError {
    fn from(e: redb::DatabaseError) -> Self {
        RxTxError::Database(e)
    }
}
impl From<redb::StorageError> for RxTxError {
    fn from(e: redb::StorageError) -> Self {
        RxTxError::Storage(e)
    }
}
impl From<redb::TableError> for RxTxError {
    fn from(e: redb::TableError) -> Self {
        RxTxError::Table(e)
    }
}
impl From<redb::CommitError> for RxTxError {
    fn from(e: redb::CommitError) -> Self {
        RxTxError::Commit(e)
    }
}
impl From<redb::TransactionError> for RxTxError {
    fn from(e: redb::TransactionError) -> Self {
        RxTxError::Transaction(e)
    }
}

impl std::fmt::Display for RxTxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RxTxError::Database(e) => write!(f, "database error: {}", e),
            RxTxError::Storage(e) => write!(f, "storage error: {}", e),
            RxTxError::Table(e) => write!(f, "table error: {}", e),
            RxTxError::Commit(e) => write!(f, "commit error: {}", e),
            RxTxError::Transaction(e) => write!(f, "transaction error: {}", e),
        }
    }
}

impl std::error::Error for RxTxError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_within_the_same_window_accumulate() {
        let mut agg = RxTxAggregator::new(60);
        let t0 = UNIX_EPOCH + Duration::from_secs(100);
        agg.record("1.2.3.4", 10, true, t0);
        agg.record("1.2.3.4", 20, true, t0 + Duration::from_secs(5));
        agg.record("1.2.3.4", 7, false, t0 + Duration::from_secs(6));
        let snap = agg.current_snapshot();
        let s = snap.get("1.2.3.4").unwrap();
        assert_eq!(s.rx, 30);
        assert_eq!(s.tx, 7);
    }

    #[test]
    fn crossing_a_window_boundary_closes_the_previous_bucket() {
        let mut agg = RxTxAggregator::new(60);
        let t0 = UNIX_EPOCH + Duration::from_secs(10);
        agg.record("host", 100, true, t0);
        let t1 = UNIX_EPOCH + Duration::from_secs(200);
        agg.record("host", 5, true, t1);
        let closed = agg.finalize_all(t1, true);
        let (_, windows) = closed.into_iter().find(|(h, _)| h == "host").unwrap();
        assert!(windows.iter().any(|w| w.rx == 100));
        assert!(windows.iter().any(|w| w.rx == 5));
    }

    #[test]
    fn finalize_without_drain_is_idempotent_within_the_same_threshold() {
        let mut agg = RxTxAggregator::new(60);
        let t0 = UNIX_EPOCH + Duration::from_secs(200);
        agg.record("host", 10, true, t0);
        let first = agg.finalize_all(t0, false);
        let second = agg.finalize_all(t0, false);
        assert!(first.is_empty() || second.is_empty());
    }

    #[test]
    fn get_aggregated_merges_history_with_the_open_bucket() {
        let mut agg = RxTxAggregator::new(60);
        let t0 = UNIX_EPOCH + Duration::from_secs(100);
        agg.record("host", 10, true, t0);
        agg.finalize_all(t0 + Duration::from_secs(60), true);
        agg.record("host", 3, true, t0 + Duration::from_secs(70));
        let rows = agg.get_aggregated("host");
        assert_eq!(rows.iter().map(|r| r.rx).sum::<u64>(), 13);
    }

    #[test]
    fn pruning_drops_history_rows_past_the_retention_window() {
        let mut agg = RxTxAggregator::new(60);
        let t0 = UNIX_EPOCH + Duration::from_secs(100);
        agg.record("host", 10, true, t0);
        agg.finalize_all(t0 + Duration::from_secs(60), true);
        agg.prune_older_than(t0 + Duration::from_secs(1_000_000), 100);
        assert!(agg.get_aggregated("host").is_empty());
    }

    fn temp_store() -> RxTxStore {
        let path = std::env::temp_dir().join(format!("coinject-rxtx-test-{}-{}", std::process::id(), std::time::SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos()));
        let _ = std::fs::remove_file(&path);
        RxTxStore::new(&path).unwrap()
    }

    #[test]
    fn persisted_windows_survive_a_reload_through_a_fresh_handle() {
        let mut agg = RxTxAggregator::new(60);
        let t0 = UNIX_EPOCH + Duration::from_secs(100);
        agg.record("10.0.0.1", 50, true, t0);
        let t1 = UNIX_EPOCH + Duration::from_secs(200);
        agg.record("10.0.0.1", 1, true, t1);
        let closed = agg.finalize_all(t1, true);

        let store = temp_store();
        for (host, windows) in &closed {
            store.persist_all(Granularity::Minute, host, windows).unwrap();
        }

        let loaded = store.load(Granularity::Minute, "10.0.0.1", 60).unwrap();
        assert_eq!(loaded.iter().map(|w| w.rx).sum::<u64>(), 50);
    }

    #[test]
    fn re_persisting_the_same_window_does_not_duplicate_it() {
        let store = temp_store();
        let window = RxTxSnapshot { begin_unix: 0, end_unix: 60, rx: 10, tx: 0 };
        store.persist(Granularity::Hour, "host", &window).unwrap();
        store.persist(Granularity::Hour, "host", &window).unwrap();
        assert_eq!(store.load(Granularity::Hour, "host", 3600).unwrap().len(), 1);
    }

    #[test]
    fn minute_and_hour_granularities_are_stored_separately() {
        let store = temp_store();
        store.persist(Granularity::Minute, "host", &RxTxSnapshot { begin_unix: 0, end_unix: 60, rx: 1, tx: 0 }).unwrap();
        store.persist(Granularity::Hour, "host", &RxTxSnapshot { begin_unix: 0, end_unix: 3600, rx: 2, tx: 0 }).unwrap();
        assert_eq!(store.load(Granularity::Minute, "host", 60).unwrap().len(), 1);
        assert_eq!(store.load(Granularity::Hour, "host", 3600).unwrap().len(), 1);
    }

    #[test]
    fn finalize_and_persist_writes_closed_windows_through_to_the_store() {
        let store = temp_store();
        let mut agg = RxTxAggregator::new(60);
        let t0 = UNIX_EPOCH + Duration::from_secs(100);
        agg.record("10.0.0.2", 30, true, t0);
        let t1 = UNIX_EPOCH + Duration::from_secs(200);
        agg.record("10.0.0.2", 5, true, t1);

        agg.finalize_and_persist(t1, true, &store, Granularity::Minute).unwrap();

        let loaded = store.load(Granularity::Minute, "10.0.0.2", 60).unwrap();
        assert_eq!(loaded.iter().map(|w| w.rx).sum::<u64>(), 30);
    }

    #[test]
    fn get_aggregated_with_store_merges_disk_history_under_the_open_bucket() {
        let store = temp_store();
        store.persist(Granularity::Minute, "10.0.0.3", &RxTxSnapshot { begin_unix: 0, end_unix: 60, rx: 100, tx: 0 }).unwrap();

        let mut agg = RxTxAggregator::new(60);
        let t1 = UNIX_EPOCH + Duration::from_secs(90);
        agg.record("10.0.0.3", 7, true, t1);

        let merged = agg.get_aggregated_with_store("10.0.0.3", &store, Granularity::Minute).unwrap();
        assert_eq!(merged.iter().map(|w| w.rx).sum::<u64>(), 107);
    }

    #[test]
    fn get_aggregated_with_store_does_not_duplicate_a_window_already_finalized_in_memory() {
        let store = temp_store();
        let mut agg = RxTxAggregator::new(60);
        let t0 = UNIX_EPOCH + Duration::from_secs(100);
        agg.record("10.0.0.4", 20, true, t0);
        let closed = agg.finalize_and_persist(UNIX_EPOCH + Duration::from_secs(200), true, &store, Granularity::Minute).unwrap();
        assert_eq!(closed.len(), 1);

        let merged = agg.get_aggregated_with_store("10.0.0.4", &store, Granularity::Minute).unwrap();
        assert_eq!(merged.iter().map(|w| w.rx).sum::<u64>(), 20);
    }
}
