//! Skiplists use a probabilistic distribution of nodes over the internal
//! levels, whereby the lowest level (level 0) contains all the nodes, and each
//! level `$n > 0$` will contain a random subset of the nodes on level
//! `$n - 1$`.
//!
//! In this crate the level of a node also decides its *placement priority*:
//! tall towers are crossed by more searches, so they are the first candidates
//! for the purely-local storage tier. The generator is injected into the map
//! at construction so that deterministic tests (and callers that want a
//! different distribution) can substitute their own.

use rand::prelude::*;

/// The tallest tower any node may have.
///
/// The header sentinel sits at exactly this level so that it participates in
/// every ring that can ever exist. A node's link array has `level + 1`
/// entries, so the header owns `MAX_LEVEL + 1` links.
pub const MAX_LEVEL: u8 = 64;

// ////////////////////////////////////////////////////////////////////////////
// Level Generator
// ////////////////////////////////////////////////////////////////////////////

/// Upon the insertion of a new node in the list, the node is replicated to
/// high levels with a certain probability as determined by a
/// [`LevelGenerator`].
pub trait LevelGenerator {
    /// The total number of levels that are assumed to exist.
    #[must_use]
    fn total(&self) -> usize;

    /// Generate a random level for a new node in the range `[0, total)`.
    ///
    /// This function should _never_ return a level greater or equal to
    /// [`total`][LevelGenerator::total].
    #[must_use]
    fn level(&mut self) -> u8;
}

/// A level generator sampling the truncated geometric distribution
/// `$P(\text{level} \geq k) = 2^{-k}$` by counting the leading zero bits of a
/// uniform 64-bit word.
///
/// Each leading zero halves the probability, which is exactly the classic
/// `$p = 1/2$` skip-list distribution, truncated at [`MAX_LEVEL`] (an
/// all-zero word yields level 64).
#[derive(Debug)]
pub struct LeadingZeros {
    /// The random number generator.
    rng: SmallRng,
}

impl LeadingZeros {
    /// Create a new generator seeded from the operating system.
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        LeadingZeros {
            rng: SmallRng::from_os_rng(),
        }
    }

    /// Create a generator from an explicit random source.
    ///
    /// This is the injection point for callers that need reproducible level
    /// sequences, e.g. `SmallRng::seed_from_u64(..)`.
    #[must_use]
    #[inline]
    pub fn with_rng(rng: SmallRng) -> Self {
        LeadingZeros { rng }
    }
}

impl Default for LeadingZeros {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl LevelGenerator for LeadingZeros {
    #[inline]
    fn total(&self) -> usize {
        MAX_LEVEL as usize + 1
    }

    #[inline]
    fn level(&mut self) -> u8 {
        let word: u64 = self.rng.random();
        // leading_zeros() is in 0..=64, so the cap at MAX_LEVEL is implicit.
        word.leading_zeros() as u8
    }
}
