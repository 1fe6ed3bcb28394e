//! Identifier generation.
//!
//! WAMP ids live in `[1, 2^53]` so they survive IEEE-754 transports. Scope
//! ids (session, subscription, registration) are drawn randomly and re-drawn
//! on collision with an active id; router-originated request ids are
//! sequential per direction.

use rand::Rng as _;
use rand::SeedableRng as _;
use rand::rngs::StdRng;

pub type SessionId = u64;
pub type SubscriptionId = u64;
pub type RegistrationId = u64;
pub type PublicationId = u64;
pub type RequestId = u64;

/// Largest assignable id (`2^53`).
pub const MAX_ID: u64 = 1 << 53;

/// Random id generator for realm-scoped ids.
#[derive(Debug)]
pub struct RandomIdGenerator {
    rng: StdRng,
}

impl RandomIdGenerator {
    pub fn new() -> Self {
        RandomIdGenerator {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn from_seed(seed: u64) -> Self {
        RandomIdGenerator {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next_id(&mut self) -> u64 {
        self.rng.gen_range(1..=MAX_ID)
    }

    /// Draws ids until one is not reported active. The id space is vastly
    /// larger than any realistic active set, so this terminates quickly.
    pub fn next_free(&mut self, mut is_active: impl FnMut(u64) -> bool) -> u64 {
        loop {
            let id = self.next_id();
            if !is_active(id) {
                return id;
            }
        }
    }

    /// Uniform index into a non-empty slice, for random callee selection.
    pub fn pick(&mut self, len: usize) -> usize {
        debug_assert!(len > 0);
        self.rng.gen_range(0..len)
    }
}

impl Default for RandomIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Sequential generator for router-originated request ids, wrapping within
/// the legal id range.
#[derive(Clone, Copy, Debug)]
pub struct SequentialIdGenerator {
    next: u64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        SequentialIdGenerator { next: 1 }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next = if self.next >= MAX_ID { 1 } else { self.next + 1 };
        id
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn random_ids_stay_in_range() {
        let mut generator = RandomIdGenerator::from_seed(7);
        for _ in 0..1000 {
            let id = generator.next_id();
            assert!((1..=MAX_ID).contains(&id));
        }
    }

    #[test]
    fn next_free_skips_active_ids() {
        let mut generator = RandomIdGenerator::from_seed(7);
        let first = generator.next_id();

        let mut probe = RandomIdGenerator::from_seed(7);
        let mut active = HashSet::new();
        active.insert(first);
        let id = probe.next_free(|candidate| active.contains(&candidate));
        assert_ne!(id, first);
    }

    #[test]
    fn sequential_ids_start_at_one_and_wrap() {
        let mut generator = SequentialIdGenerator::new();
        assert_eq!(generator.next_id(), 1);
        assert_eq!(generator.next_id(), 2);

        let mut at_edge = SequentialIdGenerator { next: MAX_ID };
        assert_eq!(at_edge.next_id(), MAX_ID);
        assert_eq!(at_edge.next_id(), 1);
    }
}
