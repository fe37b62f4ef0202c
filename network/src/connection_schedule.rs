//! Outbound connection scheduler (C7): tracks known peer endpoints
//! across three buckets (verified / unverified-new / unverified-failed)
//! and drives exponential-backoff reconnect timing. Grounded in the
//! original source's `connection_schedule.hpp` `ConnectionSchedule` /
//! `SockaddrVector` / `ConnectionLog` types, adapted to `std::time`
//! rather than a hand-rolled steady-clock wrapper.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const FAILURE_CAP: u32 = 8;
const BASE_BACKOFF: Duration = Duration::from_secs(2);
const PINNED_FAILURE_CAP: u32 = 3;

/// Rolling record of the last five connection outcomes, packed into the
/// low 5 bits the way the original `ConnectionLog` packs its `bits`
/// field; bit 5 (`1 << 5`) is a sentinel seeded at construction so
/// `consecutive_failures` never overcounts an empty log.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionLog {
    bits: u32,
}

impl Default for ConnectionLog {
    fn default() -> Self {
        ConnectionLog { bits: 1 << 5 }
    }
}

impl ConnectionLog {
    fn active_bits(&self) -> u32 {
        self.bits & 0x1f
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.active_bits().trailing_ones().min(5)
    }

    pub fn last_connection_failed(&self) -> bool {
        self.active_bits() & 1 == 1
    }

    pub fn log_failure(&mut self) {
        self.bits = (self.bits << 1) | 1;
    }

    pub fn log_success(&mut self) {
        self.bits <<= 1;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SockaddrState {
    Verified,
    UnverifiedFailed,
    UnverifiedNew,
}

pub struct Timer {
    sleep_duration: Duration,
    timeout: Instant,
}

impl Timer {
    /// A freshly-inserted endpoint wakes up immediately.
    fn new() -> Self {
        Timer { sleep_duration: Duration::ZERO, timeout: Instant::now() }
    }

    fn set(&mut self, d: Duration) {
        self.sleep_duration = d;
        self.timeout = Instant::now() + d;
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.timeout <= now
    }

    pub fn timeout(&self) -> Instant {
        self.timeout
    }
}

pub struct VectorEntry {
    pub address: SocketAddr,
    sources: HashSet<std::net::Ipv4Addr>,
    timer: Timer,
    log: ConnectionLog,
    pending: bool,
    connected: u32,
}

impl VectorEntry {
    fn new(address: SocketAddr, source: Option<std::net::Ipv4Addr>) -> Self {
        let mut sources = HashSet::new();
        if let Some(s) = source {
            sources.insert(s);
        }
        VectorEntry { address, sources, timer: Timer::new(), log: ConnectionLog::default(), pending: false, connected: 0 }
    }

    pub fn add_source(&mut self, source: std::net::Ipv4Addr) {
        self.sources.insert(source);
    }

    fn update_timer(&mut self, pinned: bool) {
        let cap = if pinned { PINNED_FAILURE_CAP } else { FAILURE_CAP };
        let failures = self.log.consecutive_failures().min(cap);
        let backoff = BASE_BACKOFF.saturating_mul(1u32 << failures);
        self.timer.set(backoff);
    }

    fn connection_established(&mut self) {
        self.connected += 1;
        self.pending = false;
    }
}

#[derive(Default)]
pub struct SockaddrVector {
    data: Vec<VectorEntry>,
}

impl SockaddrVector {
    pub fn find(&self, addr: &SocketAddr) -> Option<usize> {
        self.data.iter().position(|e| &e.address == addr)
    }

    pub fn push(&mut self, entry: VectorEntry) {
        self.data.push(entry);
    }

    pub fn remove(&mut self, idx: usize) -> VectorEntry {
        self.data.remove(idx)
    }

    /// Moves every entry whose timer has expired into a batch of
    /// outbound connect requests, marking each `pending`.
    fn expired_into(&mut self, now: Instant, out: &mut Vec<SocketAddr>) {
        for entry in self.data.iter_mut() {
            if !entry.pending && entry.timer.expired(now) {
                entry.pending = true;
                out.push(entry.address);
            }
        }
    }

    fn earliest_timeout(&self) -> Option<Instant> {
        self.data.iter().filter(|e| !e.pending).map(|e| e.timer.timeout()).min()
    }
}

/// Owns the three endpoint buckets and dispatches reconnect timing
/// across them, mirroring `ConnectionSchedule`.
#[derive(Default)]
pub struct ConnectionSchedule {
    pub verified: SockaddrVector,
    pub unverified_new: SockaddrVector,
    pub unverified_failed: SockaddrVector,
    pinned: HashSet<SocketAddr>,
}

impl ConnectionSchedule {
    pub fn new(pinned: Vec<SocketAddr>) -> Self {
        ConnectionSchedule { pinned: pinned.into_iter().collect(), ..Default::default() }
    }

    /// Inserts a freshly-learned endpoint into `unverifiedNew` unless it
    /// is already tracked somewhere.
    pub fn insert(&mut self, addr: SocketAddr, source: Option<std::net::Ipv4Addr>) {
        if self.verified.find(&addr).is_some() || self.unverified_new.find(&addr).is_some() || self.unverified_failed.find(&addr).is_some() {
            if let Some(idx) = self.unverified_new.find(&addr) {
                if let Some(s) = source {
                    self.unverified_new.data[idx].add_source(s);
                }
            }
            return;
        }
        self.unverified_new.push(VectorEntry::new(addr, source));
    }

    pub fn connection_established(&mut self, addr: SocketAddr) {
        let from_failed = self.unverified_failed.find(&addr);
        let from_new = self.unverified_new.find(&addr);
        let mut entry = if let Some(idx) = from_failed {
            self.unverified_failed.remove(idx)
        } else if let Some(idx) = from_new {
            self.unverified_new.remove(idx)
        } else if let Some(idx) = self.verified.find(&addr) {
            self.verified.remove(idx)
        } else {
            VectorEntry::new(addr, None)
        };
        entry.log.log_success();
        entry.connection_established();
        self.verified.push(entry);
    }

    /// Records a failed/ended outbound connection and moves the
    /// endpoint toward `UNVERIFIED_FAILED`, scheduling its next retry.
    pub fn outbound_failed(&mut self, addr: SocketAddr) {
        let pinned = self.pinned.contains(&addr);
        let idx = self.verified.find(&addr).map(|i| (SockaddrState::Verified, i)).or_else(|| self.unverified_new.find(&addr).map(|i| (SockaddrState::UnverifiedNew, i))).or_else(|| self.unverified_failed.find(&addr).map(|i| (SockaddrState::UnverifiedFailed, i)));
        let Some((state, idx)) = idx else { return };

        let mut entry = match state {
            SockaddrState::Verified => self.verified.remove(idx),
            SockaddrState::UnverifiedNew => self.unverified_new.remove(idx),
            SockaddrState::UnverifiedFailed => self.unverified_failed.remove(idx),
        };
        entry.log.log_failure();

        let decayed = state == SockaddrState::Verified && entry.log.consecutive_failures() as usize >= FAILURE_CAP as usize;
        entry.update_timer(pinned);

        if state == SockaddrState::Verified && !decayed {
            self.verified.push(entry);
        } else {
            self.unverified_failed.push(entry);
        }
    }

    /// Scans all three vectors and returns endpoints whose timer has
    /// expired, as a batch the event loop should open connections to.
    pub fn pop_expired(&mut self) -> Vec<SocketAddr> {
        let now = Instant::now();
        let mut out = Vec::new();
        self.verified.expired_into(now, &mut out);
        self.unverified_new.expired_into(now, &mut out);
        self.unverified_failed.expired_into(now, &mut out);
        out
    }

    /// Earliest non-expired timeout across all three vectors, so the
    /// event loop can sleep precisely instead of busy-polling.
    pub fn pop_wakeup_time(&self) -> Option<Instant> {
        [self.verified.earliest_timeout(), self.unverified_new.earliest_timeout(), self.unverified_failed.earliest_timeout()].into_iter().flatten().min()
    }

    pub fn total_tracked(&self) -> usize {
        self.verified.data.len() + self.unverified_new.data.len() + self.unverified_failed.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn freshly_inserted_endpoint_is_immediately_expired() {
        let mut schedule = ConnectionSchedule::new(vec![]);
        schedule.insert(addr(1), None);
        let expired = schedule.pop_expired();
        assert_eq!(expired, vec![addr(1)]);
    }

    #[test]
    fn connection_established_moves_endpoint_into_verified() {
        let mut schedule = ConnectionSchedule::new(vec![]);
        schedule.insert(addr(1), None);
        schedule.connection_established(addr(1));
        assert!(schedule.verified.find(&addr(1)).is_some());
        assert!(schedule.unverified_new.find(&addr(1)).is_none());
    }

    #[test]
    fn repeated_failures_decay_a_verified_peer_back_to_failed() {
        let mut schedule = ConnectionSchedule::new(vec![]);
        schedule.insert(addr(1), None);
        schedule.connection_established(addr(1));
        for _ in 0..FAILURE_CAP + 1 {
            schedule.outbound_failed(addr(1));
        }
        assert!(schedule.verified.find(&addr(1)).is_none());
        assert!(schedule.unverified_failed.find(&addr(1)).is_some());
    }

    #[test]
    fn duplicate_insert_does_not_duplicate_the_endpoint() {
        let mut schedule = ConnectionSchedule::new(vec![]);
        schedule.insert(addr(1), None);
        schedule.insert(addr(1), None);
        assert_eq!(schedule.total_tracked(), 1);
    }
}
