use serde::{Deserialize, Serialize};

/// Number of blocks per difficulty retarget epoch.
pub const RETARGET_INTERVAL: u32 = 2016;

/// Chain height, unsigned.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug, Default)]
pub struct Height(u32);

impl Height {
    pub const GENESIS: Height = Height(0);

    pub fn new(h: u32) -> Self {
        Height(h)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn succ(&self) -> Height {
        Height(self.0 + 1)
    }

    /// Largest height `<= self` that begins a retarget epoch.
    pub fn retarget_floor(&self) -> Height {
        Height(self.0 - (self.0 % RETARGET_INTERVAL))
    }

    pub fn is_retarget_boundary(&self) -> bool {
        self.0 % RETARGET_INTERVAL == 0
    }
}

impl std::ops::Add<u32> for Height {
    type Output = Height;
    fn add(self, rhs: u32) -> Height {
        Height(self.0 + rhs)
    }
}

impl std::ops::Sub<Height> for Height {
    type Output = u32;
    fn sub(self, rhs: Height) -> u32 {
        self.0 - rhs.0
    }
}

/// `Height` known at construction time to be `>= 1`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub struct NonzeroHeight(Height);

impl NonzeroHeight {
    pub fn new(h: Height) -> Option<Self> {
        if h.value() == 0 {
            None
        } else {
            Some(NonzeroHeight(h))
        }
    }

    pub fn get(&self) -> Height {
        self.0
    }
}

/// The greatest retarget-epoch-start height at or below a block's own
/// height; unconfirmed transactions reference this indirectly via
/// `PinNonce`'s offset so the encoded pin height shrinks to a handful of
/// bits instead of a full 32-bit height.
pub fn pin_floor(containing_height: Height) -> Height {
    Height(containing_height.value() - (containing_height.value() % 64))
}

/// Reconstructs an absolute pin height from a block's pin floor and the
/// small offset stored in a transaction's `PinNonce`.
pub fn pinheight_from_floored(floor: Height, offset: u8) -> Height {
    floor + offset as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retarget_floor_rounds_down_to_epoch_start() {
        assert_eq!(Height::new(0).retarget_floor(), Height::new(0));
        assert_eq!(Height::new(2015).retarget_floor(), Height::new(0));
        assert_eq!(Height::new(2016).retarget_floor(), Height::new(2016));
        assert_eq!(Height::new(4031).retarget_floor(), Height::new(2016));
    }

    #[test]
    fn nonzero_height_rejects_zero() {
        assert!(NonzeroHeight::new(Height::new(0)).is_none());
        assert!(NonzeroHeight::new(Height::new(1)).is_some());
    }

    #[test]
    fn pin_height_round_trips_through_floor_and_offset() {
        let floor = pin_floor(Height::new(130));
        let offset = 5u8;
        assert_eq!(pinheight_from_floored(floor, offset), Height::new(floor.value() + 5));
    }
}
