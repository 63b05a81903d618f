// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Core functionality for the granules blob-granule store.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

pub mod keys;
pub mod messages;
pub mod range_map;

pub use keys::{Key, KeyRange};
pub use range_map::RangeMap;

/// The epoch number of a granule manager generation.
///
/// Epoch 0 is reserved: no manager is ever elected at epoch 0, so the
/// `(epoch, seqno)` pairs `(0, 0)` and `(0, 1)` are free to act as the
/// "unmapped" and "mapped, owner unknown" sentinels during recovery.
pub type Epoch = u64;

/// Sequence number ordering ownership mutations within one manager epoch.
pub type SeqNo = u64;

/// A commit version of the backing key-value store.
pub type Version = u64;

/// Version greater than any version the store can produce.
pub const MAX_VERSION: Version = Version::MAX;

/// The `(epoch, seqno)` pair qualifying an ownership mutation.
///
/// Pairs are totally ordered lexicographically; for two conflicting
/// assignments the larger pair wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssignmentSeq {
    /// The manager epoch that issued the mutation.
    pub epoch: Epoch,
    /// The per-epoch sequence number of the mutation.
    pub seqno: SeqNo,
}

impl AssignmentSeq {
    /// The "range is not mapped" sentinel.
    pub const UNMAPPED: Self = Self { epoch: 0, seqno: 0 };
    /// The "range is mapped but the owner is unknown" sentinel.
    pub const UNKNOWN_OWNER: Self = Self { epoch: 0, seqno: 1 };

    /// Creates a new assignment sequence.
    pub fn new(epoch: Epoch, seqno: SeqNo) -> Self {
        Self { epoch, seqno }
    }

    /// Returns true iff this is one of the recovery sentinels (epoch 0).
    pub fn is_sentinel(&self) -> bool {
        self.epoch == 0
    }
}

impl fmt::Display for AssignmentSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.epoch, self.seqno)
    }
}

macro_rules! uid_type {
    ($(#[$outer:meta])* $name:ident) => {
        $(#[$outer])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        pub struct $name(pub u128);

        impl $name {
            /// The zero id, used as the "absent" sentinel.
            pub const ZERO: Self = Self(0);

            /// Generates a fresh random id.
            pub fn generate<R: Rng>(rng: &mut R) -> Self {
                Self(rng.r#gen())
            }

            /// Returns true iff this is the zero sentinel.
            pub fn is_zero(&self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Short prefix is enough to identify ids in logs.
                write!(f, "{:08x}", (self.0 >> 96) as u32)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:032x})"), self.0)
            }
        }
    };
}

uid_type! {
    /// Durable identity of a granule.
    ///
    /// Survives reassignment but not splits: each split child receives a
    /// fresh id and records its parents in the granule history.
    GranuleId
}

uid_type! {
    /// Identity of a granule worker process.
    WorkerId
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn assignment_seq_orders_lexicographically() {
        let older = AssignmentSeq::new(2, 90);
        let newer = AssignmentSeq::new(3, 1);
        assert!(older < newer);
        assert!(AssignmentSeq::new(3, 2) > newer);
        assert!(AssignmentSeq::UNMAPPED < AssignmentSeq::UNKNOWN_OWNER);
        assert!(AssignmentSeq::UNKNOWN_OWNER < AssignmentSeq::new(1, 0));
    }

    #[test]
    fn generated_ids_are_distinct() {
        let mut rng = StdRng::seed_from_u64(7);
        let first = WorkerId::generate(&mut rng);
        let second = WorkerId::generate(&mut rng);
        assert_ne!(first, second);
        assert!(!first.is_zero());
        assert!(WorkerId::ZERO.is_zero());
    }
}
