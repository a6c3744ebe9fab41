//! Nearest-Identifier Placement
//!
//! A key is routed in two steps: first to the Part whose id is closest to
//! the key hash, then to the Block of that Part whose id is closest. Both
//! steps use the same rule, implemented here as a pure function over a set
//! of identified candidates.
//!
//! Distance is the byte-wise XOR of id and hash, ordered lexicographically.
//! On an exact tie the first candidate in iteration order wins.

use crate::storage::id::{Id, KeyHash};
use std::sync::Arc;

/// Anything that can be placed by identifier.
pub trait Identified {
    fn id(&self) -> &Id;
}

impl Identified for Id {
    fn id(&self) -> &Id {
        self
    }
}

impl<T: Identified + ?Sized> Identified for Arc<T> {
    fn id(&self) -> &Id {
        (**self).id()
    }
}

/// Returns the candidate closest to `hash`, or `None` if there are none.
pub fn closest<'a, T, I>(candidates: I, hash: &KeyHash) -> Option<&'a T>
where
    T: Identified + ?Sized + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut best: Option<(&'a T, [u8; 16])> = None;

    for candidate in candidates {
        let d = candidate.id().distance(hash);
        match &best {
            Some((_, best_d)) if d >= *best_d => {}
            _ => best = Some((candidate, d)),
        }
    }

    best.map(|(candidate, _)| candidate)
}
