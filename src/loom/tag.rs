use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Process-wide identifier of a registered buffer.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    From,
    Into,
    Serialize,
    Deserialize,
)]
#[display("#{_0}")]
pub struct Tag(pub u64);

impl Tag {
    /// Tag of the `index`-th tile of a tensor whose first tile carries `self`.
    #[inline]
    pub fn tile(self, index: usize) -> Tag {
        Tag(self.0 + index as u64)
    }
}

/// The tag counter threaded through every construction call.
///
/// It is a plain value: each allocation consumes it and hands back its successor, which the
/// caller must pass on to the next allocation.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize,
)]
#[display("next {_0}")]
#[must_use = "the advanced counter must be threaded into the next allocation"]
pub struct NextTag(u64);

impl NextTag {
    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Consumes one tag.
    #[inline]
    pub fn allocate(self) -> (Tag, NextTag) {
        self.reserve(1)
    }

    /// Consumes `count` consecutive tags and returns the first of them.
    #[inline]
    pub fn reserve(self, count: usize) -> (Tag, NextTag) {
        (Tag(self.0), NextTag(self.0 + count as u64))
    }
}

/// Allocates one tag from the counter, returning it together with the advanced counter.
#[inline]
pub fn allocate_tag(next: NextTag) -> (Tag, NextTag) {
    next.allocate()
}
