//! Median-timestamp validation rule (C3, spec §4.1), ported from
//! `TimestampValidator` in the original source.

pub const MEDIAN_N: usize = 11;
pub const TOLERANCE_MINUTES: u64 = 2 * 60;

#[derive(Clone, Debug)]
pub struct TimestampValidator {
    pos: usize,
    /// Named after the source's `tmax`. The source's `append` assigns the
    /// *smaller* of `tmax` and the new timestamp whenever `tmax` is
    /// larger, i.e. this field tracks a running *minimum*, not a maximum,
    /// despite its name. That looks backwards next to `valid`'s "reject a
    /// large drop below tmax" comment, but changing it would silently
    /// change which timestamps get accepted by an already-running chain,
    /// so the original (if misleadingly named) behaviour is reproduced
    /// here rather than "fixed". See the decision recorded in the design
    /// notes.
    tmax: u64,
    data: [u64; MEDIAN_N],
}

impl Default for TimestampValidator {
    fn default() -> Self {
        TimestampValidator { pos: 0, tmax: 0, data: [0; MEDIAN_N] }
    }
}

impl TimestampValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn valid(&self, tnew: u64) -> bool {
        if tnew == 0 {
            return false;
        }
        if tnew + TOLERANCE_MINUTES * 60 < self.tmax {
            return false;
        }
        let bound = MEDIAN_N / 2;
        let mut n = 0usize;
        for &t in &self.data {
            if tnew >= t {
                n += 1;
                if n > bound {
                    return true;
                }
            }
        }
        false
    }

    /// Mirrors the source's `append` exactly, including the
    /// min-not-max assignment to `tmax` documented on the field.
    pub fn append(&mut self, tnew: u64) {
        if self.tmax > tnew {
            self.tmax = tnew;
        }
        self.data[self.pos] = tnew;
        self.pos += 1;
        if self.pos >= MEDIAN_N {
            self.pos = 0;
        }
    }

    pub fn get_valid_timestamp(&self, now: u64) -> u64 {
        let mut sorted = self.data;
        sorted.sort_unstable();
        let median = sorted[(MEDIAN_N + 1) / 2];
        let mut v = median.max(now);
        if v + TOLERANCE_MINUTES * 60 < self.tmax {
            v = self.tmax - TOLERANCE_MINUTES * 60;
        }
        v
    }
}
