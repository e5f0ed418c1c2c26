use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// A pair of byte counts: `up` flows client -> engine, `down` engine -> client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traffic {
    pub up: u64,
    pub down: u64,
}

impl Traffic {
    pub fn new(up: u64, down: u64) -> Self {
        Self { up, down }
    }

    pub fn is_zero(&self) -> bool {
        self.up == 0 && self.down == 0
    }

    /// Difference to an earlier reading. A counter that went backwards
    /// (engine restart, overflow) contributes zero instead of a negative.
    pub fn saturating_delta(&self, previous: Traffic) -> Traffic {
        Traffic {
            up: self.up.saturating_sub(previous.up),
            down: self.down.saturating_sub(previous.down),
        }
    }
}

impl Add for Traffic {
    type Output = Traffic;

    fn add(self, rhs: Traffic) -> Traffic {
        Traffic {
            up: self.up.saturating_add(rhs.up),
            down: self.down.saturating_add(rhs.down),
        }
    }
}

impl AddAssign for Traffic {
    fn add_assign(&mut self, rhs: Traffic) {
        *self = *self + rhs;
    }
}
