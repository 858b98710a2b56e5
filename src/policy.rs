//! Buffer sizing policy
//!
//! A [`GrowthPolicy`] is the immutable configuration a
//! [`crate::SegmentedArray`] is created with: element size, alignment,
//! capacity bounds and the rule used to size the next buffer when the
//! current one fills up. The growth rule is an explicit
//! [`GrowthStrategy`] value so either behavior can be selected and
//! verified independently.

use crate::error::{AllocError, AllocResult};
use crate::utils::{align_up, CheckedArithmetic};

/// Default slot alignment
pub const DEFAULT_ALIGNMENT: u32 = 4;

/// Smallest buffer capacity handed out
pub const MIN_BUFFER_ELEMS: u32 = 8;

/// Largest buffer capacity handed out
pub const MAX_BUFFER_ELEMS: u32 = u32::MAX / 2;

/// Rule for sizing the next buffer from the previous one's capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrowthStrategy {
    /// Double the previous capacity, clamped to the configured bounds
    #[default]
    Exponential,
    /// Every buffer uses the initial capacity
    Flat,
}

/// Immutable sizing rule for one array
#[derive(Debug, Clone)]
pub struct GrowthPolicy {
    elem_size: u32,
    initial_num_elems: u32,
    max_num_elems: u32,
    alignment: u32,
    strategy: GrowthStrategy,
    tag: &'static str,
}

impl GrowthPolicy {
    /// Creates a policy for `elem_size`-byte elements with default
    /// bounds, alignment and strategy
    pub fn new(elem_size: u32) -> Self {
        Self {
            elem_size,
            initial_num_elems: MIN_BUFFER_ELEMS,
            max_num_elems: MAX_BUFFER_ELEMS,
            alignment: DEFAULT_ALIGNMENT,
            strategy: GrowthStrategy::default(),
            tag: "untagged",
        }
    }

    /// Sets the capacity of the first buffer
    #[must_use = "builder methods must be chained or built"]
    pub fn with_initial_capacity(mut self, num_elems: u32) -> Self {
        self.initial_num_elems = num_elems;
        self
    }

    /// Sets the capacity ceiling for grown buffers
    #[must_use = "builder methods must be chained or built"]
    pub fn with_max_capacity(mut self, num_elems: u32) -> Self {
        self.max_num_elems = num_elems;
        self
    }

    /// Sets the slot alignment (must be a power of two)
    #[must_use = "builder methods must be chained or built"]
    pub fn with_alignment(mut self, alignment: u32) -> Self {
        self.alignment = alignment;
        self
    }

    /// Sets the growth strategy
    #[must_use = "builder methods must be chained or built"]
    pub fn with_strategy(mut self, strategy: GrowthStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the category tag used in diagnostics and logging
    ///
    /// The tag labels output only; it never affects allocation
    /// behavior.
    #[must_use = "builder methods must be chained or built"]
    pub fn with_tag(mut self, tag: &'static str) -> Self {
        self.tag = tag;
        self
    }

    /// Validates the policy
    pub fn validate(&self) -> AllocResult<()> {
        if self.elem_size == 0 {
            return Err(AllocError::invalid_config("element size must be non-zero"));
        }
        if !self.alignment.is_power_of_two() {
            return Err(AllocError::invalid_config(
                "alignment must be a power of two",
            ));
        }
        if self.initial_num_elems == 0 {
            return Err(AllocError::invalid_config(
                "initial capacity must be non-zero",
            ));
        }
        if self.initial_num_elems > self.max_num_elems {
            return Err(AllocError::invalid_config(
                "initial capacity must not exceed max capacity",
            ));
        }
        if self.max_num_elems > MAX_BUFFER_ELEMS {
            return Err(AllocError::invalid_config("max capacity out of range"));
        }
        // The largest buffer this policy can produce must be addressable.
        (self.slot_size() as usize).try_mul(self.max_num_elems as usize)?;
        Ok(())
    }

    /// Capacity of the next buffer given the previous buffer's
    /// capacity; `prev_num_elems` of zero means no buffer exists yet
    pub fn next_capacity(&self, prev_num_elems: u32) -> u32 {
        match self.strategy {
            GrowthStrategy::Exponential => {
                if prev_num_elems == 0 {
                    self.initial_num_elems
                } else {
                    prev_num_elems
                        .saturating_mul(2)
                        .clamp(self.initial_num_elems, self.max_num_elems)
                }
            }
            GrowthStrategy::Flat => self.initial_num_elems,
        }
    }

    /// Configured element size in bytes
    #[inline]
    pub fn elem_size(&self) -> u32 {
        self.elem_size
    }

    /// Element size rounded up to the alignment; the stride between
    /// slots in a buffer
    #[inline]
    pub fn slot_size(&self) -> u32 {
        align_up(self.elem_size as usize, self.alignment as usize) as u32
    }

    /// Configured slot alignment
    #[inline]
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Capacity of the first buffer
    #[inline]
    pub fn initial_capacity(&self) -> u32 {
        self.initial_num_elems
    }

    /// Capacity ceiling
    #[inline]
    pub fn max_capacity(&self) -> u32 {
        self.max_num_elems
    }

    /// Configured growth strategy
    #[inline]
    pub fn strategy(&self) -> GrowthStrategy {
        self.strategy
    }

    /// Category tag for diagnostics
    #[inline]
    pub fn tag(&self) -> &'static str {
        self.tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exponential_growth_sequence() {
        let policy = GrowthPolicy::new(8)
            .with_initial_capacity(8)
            .with_max_capacity(64);

        let mut capacity = policy.next_capacity(0);
        let mut observed = vec![capacity];
        for _ in 0..4 {
            capacity = policy.next_capacity(capacity);
            observed.push(capacity);
        }
        assert_eq!(observed, vec![8, 16, 32, 64, 64]);
    }

    #[test]
    fn test_flat_growth_sequence() {
        let policy = GrowthPolicy::new(8)
            .with_initial_capacity(8)
            .with_max_capacity(64)
            .with_strategy(GrowthStrategy::Flat);

        assert_eq!(policy.next_capacity(0), 8);
        assert_eq!(policy.next_capacity(8), 8);
        assert_eq!(policy.next_capacity(64), 8);
    }

    #[test]
    fn test_validation() {
        assert!(GrowthPolicy::new(16).validate().is_ok());
        assert!(GrowthPolicy::new(0).validate().is_err());
        assert!(GrowthPolicy::new(16).with_alignment(3).validate().is_err());
        assert!(GrowthPolicy::new(16)
            .with_initial_capacity(0)
            .validate()
            .is_err());
        assert!(GrowthPolicy::new(16)
            .with_initial_capacity(100)
            .with_max_capacity(10)
            .validate()
            .is_err());
    }

    #[test]
    fn test_slot_size_rounds_to_alignment() {
        let policy = GrowthPolicy::new(5).with_alignment(8);
        assert_eq!(policy.elem_size(), 5);
        assert_eq!(policy.slot_size(), 8);

        let policy = GrowthPolicy::new(16).with_alignment(8);
        assert_eq!(policy.slot_size(), 16);
    }

    #[test]
    fn test_accessors_reflect_builder() {
        let policy = GrowthPolicy::new(12)
            .with_initial_capacity(16)
            .with_max_capacity(128)
            .with_alignment(16)
            .with_strategy(GrowthStrategy::Flat);
        assert_eq!(policy.initial_capacity(), 16);
        assert_eq!(policy.max_capacity(), 128);
        assert_eq!(policy.alignment(), 16);
        assert_eq!(policy.strategy(), GrowthStrategy::Flat);
    }

    #[test]
    fn test_tag_is_label_only() {
        let plain = GrowthPolicy::new(8);
        let tagged = GrowthPolicy::new(8).with_tag("card-set");
        assert_eq!(tagged.tag(), "card-set");
        assert_eq!(plain.next_capacity(16), tagged.next_capacity(16));
        assert_eq!(plain.slot_size(), tagged.slot_size());
    }

    proptest! {
        #[test]
        fn prop_next_capacity_within_bounds(
            initial in 1u32..1024,
            extra in 0u32..1024,
            prev in 1u32..1_000_000,
        ) {
            let max = initial + extra;
            let policy = GrowthPolicy::new(8)
                .with_initial_capacity(initial)
                .with_max_capacity(max);
            let next = policy.next_capacity(prev);
            prop_assert!(next >= initial);
            prop_assert!(next <= max);
        }

        #[test]
        fn prop_exponential_is_monotone_until_clamp(prev in 1u32..1_000_000) {
            let policy = GrowthPolicy::new(8)
                .with_initial_capacity(1)
                .with_max_capacity(u32::MAX / 2);
            prop_assert!(policy.next_capacity(prev) >= prev);
        }
    }
}
