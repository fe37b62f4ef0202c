//! Contiguous runs of headers (C3, spec §4.2 and §3 "Batch / Grid"),
//! ported from `Batch::worksum` and `Batch::valid_inner_links` /
//! `Grid::valid_checkpoint` in the original source.

use crate::hash::Hash;
use crate::header::Header;
use crate::height::Height;
use crate::worksum::Worksum;

pub const BATCHSIZE: usize = 256;

#[derive(Clone, Debug)]
pub struct Batch {
    headers: Vec<Header>,
}

impl Batch {
    pub fn new(headers: Vec<Header>) -> Self {
        assert!(headers.len() <= BATCHSIZE, "batch exceeds BATCHSIZE");
        Batch { headers }
    }

    pub fn size(&self) -> usize {
        self.headers.len()
    }

    pub fn get(&self, i: usize) -> &Header {
        &self.headers[i]
    }

    /// True iff every header's `prevHash` equals the hash of its
    /// immediate predecessor within the batch.
    pub fn valid_inner_links(&self) -> bool {
        if self.headers.len() <= 1 {
            return true;
        }
        self.headers.windows(2).all(|pair| pair[1].prev_hash == pair[0].hash())
    }

    /// Segmented worksum accumulation (spec §4.2): walks the batch
    /// top-down, treating every header inside one retarget epoch as
    /// contributing an equal share, so the whole batch costs
    /// O(#retarget-epochs) multiplications rather than O(len).
    pub fn worksum(&self, offset: Height, max_elements: u32) -> Worksum {
        let s = (self.headers.len() as u32).min(max_elements);
        if s == 0 {
            return Worksum::zero();
        }
        let mut rel_upper = s - 1;
        let mut sum = Worksum::zero();
        loop {
            let header = &self.headers[rel_upper as usize];
            let mut w = Worksum::from_target(&header.target());
            let rf = (offset + rel_upper).retarget_floor();
            let (factor, done) = if rf == Height::new(1) {
                (rel_upper + 1, true)
            } else if rf <= offset {
                (rel_upper + 1, true)
            } else {
                let rel_lower = rf.value() - (offset.value() + 1);
                let factor = rel_upper - rel_lower;
                rel_upper = rel_lower;
                (factor, false)
            };
            w *= factor;
            sum += w;
            if done {
                break;
            }
        }
        sum
    }
}

/// An optional pin used to checkpoint a grid against a known-good header
/// at a fixed slot, preventing a long low-work fork from being accepted
/// silently.
pub struct GridCheckpoint {
    pub slot: usize,
    pub final_header: Hash,
}

/// A persisted sequence of batches.
pub struct Grid {
    batches: Vec<Batch>,
    checkpoint: Option<GridCheckpoint>,
}

impl Grid {
    pub fn new(batches: Vec<Batch>, checkpoint: Option<GridCheckpoint>) -> Self {
        Grid { batches, checkpoint }
    }

    pub fn slot_end(&self) -> usize {
        self.batches.iter().map(Batch::size).sum()
    }

    fn header_at_slot(&self, slot: usize) -> Option<&Header> {
        let mut remaining = slot;
        for batch in &self.batches {
            if remaining < batch.size() {
                return Some(batch.get(remaining));
            }
            remaining -= batch.size();
        }
        None
    }

    pub fn valid_checkpoint(&self) -> bool {
        match &self.checkpoint {
            None => true,
            Some(cp) => cp.slot < self.slot_end() && self.header_at_slot(cp.slot).map(Header::hash) == Some(cp.final_header),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_with(prev_hash: Hash, nonce_tail: u32) -> Header {
        Header {
            prev_hash,
            target_compact: 0x1f00_ffff,
            merkle_root: Hash::ZERO,
            version: 4,
            timestamp: 1,
            nonce_tail,
        }
    }

    #[test]
    fn two_linked_headers_form_a_valid_batch() {
        let h1 = header_with(Hash::ZERO, 1);
        let h2 = header_with(h1.hash(), 2);
        let batch = Batch::new(vec![h1, h2]);
        assert!(batch.valid_inner_links());
    }

    #[test]
    fn mutated_prev_hash_breaks_the_link() {
        let h1 = header_with(Hash::ZERO, 1);
        let mut h2 = header_with(h1.hash(), 2);
        h2.prev_hash = Hash::new(b"wrong");
        let batch = Batch::new(vec![h1, h2]);
        assert!(!batch.valid_inner_links());
    }

    #[test]
    fn worksum_of_single_header_batch_is_its_own_target_work() {
        let h = header_with(Hash::ZERO, 1);
        let batch = Batch::new(vec![h]);
        let w = batch.worksum(Height::new(0), 256);
        assert_eq!(w, Worksum::from_target(&h.target()));
    }

    #[test]
    fn missing_checkpoint_is_trivially_valid() {
        let grid = Grid::new(vec![Batch::new(vec![])], None);
        assert!(grid.valid_checkpoint());
    }
}
