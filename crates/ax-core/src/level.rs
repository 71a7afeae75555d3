use serde::{Deserialize, Serialize};

/// Maximum number of simultaneously active vmap levels.
///
/// A level identifies one nesting depth of vmap: the outermost call gets the
/// smallest level, and levels are assigned monotonically on entry. Keeping
/// the universe at one machine word makes membership, union, and popcount
/// single instructions.
pub const MAX_LEVELS: usize = 64;

/// Fixed-width bitset over vmap levels in `[0, MAX_LEVELS)`.
///
/// Bit `i` set means level `i` contributes a batch dimension to the
/// associated physical array. The set bit with the smallest index occupies
/// the outermost (dimension 0) physical position, so physical batch-dim
/// order always follows ascending level order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LevelSet(u64);

impl LevelSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn singleton(level: usize) -> Self {
        let mut set = Self::empty();
        set.insert(level);
        set
    }

    pub fn insert(&mut self, level: usize) {
        assert!(
            level < MAX_LEVELS,
            "vmap level {level} exceeds the maximum of {MAX_LEVELS} nested levels"
        );
        self.0 |= 1 << level;
    }

    #[must_use]
    pub fn contains(self, level: usize) -> bool {
        level < MAX_LEVELS && self.0 & (1 << level) != 0
    }

    /// Number of set levels, i.e. the number of leading batch dimensions on
    /// the associated physical array.
    #[must_use]
    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of set levels strictly below `level`: the front physical
    /// position `level` occupies (or would occupy) among the batch dims.
    #[must_use]
    pub fn index_of(self, level: usize) -> usize {
        assert!(level < MAX_LEVELS);
        (self.0 & ((1u64 << level) - 1)).count_ones() as usize
    }

    /// Iterate over set levels in ascending order.
    #[must_use]
    pub fn iter(self) -> Levels {
        Levels(self.0)
    }
}

impl std::ops::BitOr for LevelSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for LevelSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl FromIterator<usize> for LevelSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = Self::empty();
        for level in iter {
            set.insert(level);
        }
        set
    }
}

impl IntoIterator for LevelSet {
    type Item = usize;
    type IntoIter = Levels;

    fn into_iter(self) -> Levels {
        self.iter()
    }
}

/// Ascending iterator over the levels of a [`LevelSet`].
#[derive(Debug, Clone)]
pub struct Levels(u64);

impl Iterator for Levels {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let level = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(level)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let count = self.0.count_ones() as usize;
        (count, Some(count))
    }
}

impl ExactSizeIterator for Levels {}
