// src/occupancy.rs
//
// Bounded occupancy counter. Knows nothing about gates or tracks; it is
// driven only by committed crossing deltas and the startup seed.

#[derive(Debug, Clone)]
pub struct OccupancyCounter {
    value: u32,
    capacity: u32,
}

impl OccupancyCounter {
    /// `initial` is clamped into [0, capacity].
    pub fn new(initial: u32, capacity: u32) -> Self {
        Self {
            value: initial.min(capacity),
            capacity,
        }
    }

    pub fn current(&self) -> u32 {
        self.value
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Value that `apply(delta)` would produce, without changing state.
    pub fn preview(&self, delta: i32) -> u32 {
        let next = i64::from(self.value) + i64::from(delta);
        next.clamp(0, i64::from(self.capacity)) as u32
    }

    /// Apply a signed delta, clamped to [0, capacity]. Returns the new value.
    pub fn apply(&mut self, delta: i32) -> u32 {
        self.value = self.preview(delta);
        self.value
    }

    /// Overwrite the value (bootstrap seed), clamped to capacity.
    pub fn set(&mut self, value: u32) -> u32 {
        self.value = value.min(self.capacity);
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_moves_and_returns_value() {
        let mut c = OccupancyCounter::new(10, 73);
        assert_eq!(c.apply(1), 11);
        assert_eq!(c.apply(-1), 10);
        assert_eq!(c.current(), 10);
    }

    #[test]
    fn test_clamped_at_zero() {
        let mut c = OccupancyCounter::new(0, 73);
        assert_eq!(c.apply(-1), 0);
        assert_eq!(c.current(), 0);
    }

    #[test]
    fn test_clamped_at_capacity() {
        let mut c = OccupancyCounter::new(73, 73);
        assert_eq!(c.apply(1), 73);
        assert_eq!(c.apply(-1), 72);
    }

    #[test]
    fn test_initial_and_seed_clamped() {
        let mut c = OccupancyCounter::new(500, 73);
        assert_eq!(c.current(), 73);
        assert_eq!(c.set(200), 73);
        assert_eq!(c.set(4), 4);
    }

    /// xorshift64, deterministic across runs.
    fn next_rand(state: &mut u64) -> u64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        *state
    }

    #[test]
    fn test_stays_within_bounds_for_mixed_runs() {
        for (start, capacity) in [(0, 0), (0, 1), (0, 73), (36, 73), (73, 73), (500, 73), (5, 10)] {
            let mut c = OccupancyCounter::new(start, capacity);
            let mut rng = 0x9E37_79B9_7F4A_7C15u64 ^ u64::from(capacity) ^ (u64::from(start) << 32);
            let (mut hit_floor, mut hit_ceiling) = (false, false);

            for _ in 0..200 {
                let delta = if next_rand(&mut rng) % 2 == 0 { 1 } else { -1 };
                // Runs long enough to cross the whole range and pile up at a bound
                let run = 1 + next_rand(&mut rng) % (u64::from(capacity) * 2 + 6);
                for _ in 0..run {
                    let before = c.current();
                    let previewed = c.preview(delta);
                    let after = c.apply(delta);
                    assert_eq!(previewed, after);
                    assert!(after <= capacity, "{} over capacity {}", after, capacity);
                    assert!(after.abs_diff(before) <= 1);
                    hit_floor |= after == 0;
                    hit_ceiling |= after == capacity;
                }
            }
            assert!(hit_floor && hit_ceiling, "start {} capacity {}", start, capacity);
        }
    }

    #[test]
    fn test_preview_does_not_mutate() {
        let c = OccupancyCounter::new(5, 73);
        assert_eq!(c.preview(1), 6);
        assert_eq!(c.current(), 5);
    }
}
