//! Compile/init-time derivation of the constants that make a cache shape
//! valid: set count, per-line packing ratios, and alignment preconditions.
//!
//! [`Layout`] is the declarative, serde-deserializable shape a caller asks
//! for (the same way sibling configuration structs in this codebase are
//! loaded from a config file rather than hand-assembled). [`Layout::validate`]
//! turns it into a [`Geometry`] or rejects it with a [`LayoutError`] -- the
//! rejection always happens before any arena is allocated.

use std::error::Error as StdError;
use std::fmt::{self, Display};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The set-associativity values this cache supports.
///
/// Restricted to values whose base-2 logarithm is 1, 2, or 4, so the CLOCK
/// hand (`log2(ways)` bits wide) never needs a width outside the set this
/// crate's [`PackedIntArray`](crate::packed::PackedIntArray) supports.
pub const VALID_WAYS: [u32; 3] = [2, 4, 16];

/// The tag widths this cache supports.
pub const VALID_TAG_BITS: [u32; 2] = [8, 16];

/// The reference-counter widths this cache supports.
pub const VALID_CLOCK_BITS: [u32; 3] = [1, 2, 4];

/// The requested shape of a [`SetAssociativeCache`](crate::cache::SetAssociativeCache).
///
/// None of these fields alone make a cache valid or invalid; validity is a
/// property of the whole tuple plus the key and value sizes, checked by
/// [`Layout::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Layout {
    /// Set associativity: how many ways share a set.
    pub ways: u32,
    /// Bits of the hash kept per slot as a fast discriminator.
    pub tag_bits: u32,
    /// Width of the per-slot CLOCK reference counter.
    pub clock_bits: u32,
    /// The alignment target (typically 64) each arena's byte size must be a
    /// multiple of.
    pub cache_line_size: u32,
    /// Optional override for the value arena's alignment. When present it
    /// must be strictly greater than `V`'s natural alignment and must
    /// divide `size_of::<V>()`.
    #[cfg_attr(feature = "serde", serde(default))]
    pub value_alignment: Option<usize>,
}

impl Layout {
    /// A layout tuned for 16-way associativity with a 2-bit CLOCK counter
    /// and a 64-byte cache line -- the configuration used throughout this
    /// crate's test scenarios.
    pub const fn sixteen_way() -> Self {
        Self {
            ways: 16,
            tag_bits: 8,
            clock_bits: 2,
            cache_line_size: 64,
            value_alignment: None,
        }
    }

    /// Validates this layout against the key and value sizes of a concrete
    /// cache instantiation, producing the derived [`Geometry`] on success.
    ///
    /// This never allocates and never panics on a bad `Layout`; a bad
    /// configuration is always a `LayoutError`, per the "reject at
    /// build/startup" policy for configuration errors.
    pub fn validate(
        &self,
        key_size: usize,
        value_size: usize,
        value_natural_align: usize,
    ) -> Result<Geometry, LayoutError> {
        if !VALID_WAYS.contains(&self.ways) {
            return Err(LayoutError::InvalidWays(self.ways));
        }
        if !VALID_TAG_BITS.contains(&self.tag_bits) {
            return Err(LayoutError::InvalidTagBits(self.tag_bits));
        }
        if !VALID_CLOCK_BITS.contains(&self.clock_bits) {
            return Err(LayoutError::InvalidClockBits(self.clock_bits));
        }
        if !self.cache_line_size.is_power_of_two() {
            return Err(LayoutError::CacheLineNotPowerOfTwo(self.cache_line_size));
        }

        let clock_hand_bits = self.ways.trailing_zeros();
        if !VALID_CLOCK_BITS.contains(&clock_hand_bits) {
            // Unreachable given VALID_WAYS, but keep the check explicit so a
            // future change to VALID_WAYS can't silently violate it.
            return Err(LayoutError::InvalidClockHandBits(clock_hand_bits));
        }

        let line_bits = self.cache_line_size as u64 * 8;

        let tags_per_line = checked_exact_div(line_bits, self.ways as u64 * self.tag_bits as u64)
            .ok_or(LayoutError::TagsIndivisible {
                cache_line_size: self.cache_line_size,
                ways: self.ways,
                tag_bits: self.tag_bits,
            })?;
        let clocks_per_line =
            checked_exact_div(line_bits, self.ways as u64 * self.clock_bits as u64).ok_or(
                LayoutError::CountsIndivisible {
                    cache_line_size: self.cache_line_size,
                    ways: self.ways,
                    clock_bits: self.clock_bits,
                },
            )?;
        let clock_hands_per_line =
            checked_exact_div(line_bits, clock_hand_bits as u64).ok_or(
                LayoutError::ClockHandsIndivisible {
                    cache_line_size: self.cache_line_size,
                    clock_hand_bits,
                },
            )?;

        if key_size > value_size {
            return Err(LayoutError::KeyLargerThanValue {
                key_size,
                value_size,
            });
        }
        if key_size >= self.cache_line_size as usize {
            return Err(LayoutError::KeyNotSmallerThanCacheLine {
                key_size,
                cache_line_size: self.cache_line_size,
            });
        }
        if key_size == 0 || self.cache_line_size as usize % key_size != 0 {
            return Err(LayoutError::CacheLineNotMultipleOfKey {
                key_size,
                cache_line_size: self.cache_line_size,
            });
        }
        let cache_line_size = self.cache_line_size as usize;
        if value_size == 0
            || !(cache_line_size % value_size == 0 || value_size % cache_line_size == 0)
        {
            return Err(LayoutError::CacheLineValueMismatch {
                value_size,
                cache_line_size: self.cache_line_size,
            });
        }

        let value_alignment = match self.value_alignment {
            Some(requested) => {
                if !requested.is_power_of_two() {
                    return Err(LayoutError::ValueAlignmentNotPowerOfTwo { requested });
                }
                if requested <= value_natural_align {
                    return Err(LayoutError::ValueAlignmentNotStrictlyGreater {
                        requested,
                        natural: value_natural_align,
                    });
                }
                if value_size % requested != 0 {
                    return Err(LayoutError::ValueAlignmentDoesNotDivideSize {
                        requested,
                        value_size,
                    });
                }
                requested
            }
            None => value_natural_align,
        };

        Ok(Geometry {
            ways: self.ways,
            tag_bits: self.tag_bits,
            clock_bits: self.clock_bits,
            clock_hand_bits,
            cache_line_size: self.cache_line_size,
            tags_per_line: tags_per_line as u32,
            clocks_per_line: clocks_per_line as u32,
            clock_hands_per_line: clock_hands_per_line as u32,
            value_alignment,
        })
    }
}

fn checked_exact_div(numerator: u64, denominator: u64) -> Option<u64> {
    if denominator == 0 || numerator % denominator != 0 {
        None
    } else {
        Some(numerator / denominator)
    }
}

/// Derived, validated layout constants for a concrete `(Layout, Key, Value)`
/// instantiation. Produced only by [`Layout::validate`]; every
/// [`SetAssociativeCache`](crate::cache::SetAssociativeCache) holds one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Set associativity.
    pub ways: u32,
    /// Bits per tag.
    pub tag_bits: u32,
    /// Bits per reference counter.
    pub clock_bits: u32,
    /// `log2(ways)`: bits per CLOCK hand.
    pub clock_hand_bits: u32,
    /// Cache line size in bytes.
    pub cache_line_size: u32,
    /// How many tags fit in one cache line.
    pub tags_per_line: u32,
    /// How many counters fit in one cache line.
    pub clocks_per_line: u32,
    /// How many CLOCK hands fit in one cache line.
    pub clock_hands_per_line: u32,
    /// The effective alignment the value arena is allocated with.
    pub value_alignment: usize,
}

impl Geometry {
    /// The maximum value a reference counter can saturate to.
    pub fn max_count(&self) -> u64 {
        (1u64 << self.clock_bits) - 1
    }

    /// The per-set CLOCK sweep safety bound: `ways * (2^clock_bits - 1) + 1`.
    pub fn clock_sweep_bound(&self) -> u64 {
        self.ways as u64 * self.max_count() + 1
    }
}

/// A [`Layout`] (plus the key/value sizes it was checked against) that fails
/// one of the geometry preconditions in the specification.
///
/// Every variant names the offending field(s) so a rejected configuration is
/// debuggable without re-deriving the arithmetic by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// `ways` was not one of [`VALID_WAYS`].
    InvalidWays(u32),
    /// `tag_bits` was not one of [`VALID_TAG_BITS`].
    InvalidTagBits(u32),
    /// `clock_bits` was not one of [`VALID_CLOCK_BITS`].
    InvalidClockBits(u32),
    /// `log2(ways)` was not 1, 2, or 4.
    InvalidClockHandBits(u32),
    /// `cache_line_size` was not a power of two.
    CacheLineNotPowerOfTwo(u32),
    /// `(cache_line_size * 8) / (ways * tag_bits)` did not divide evenly.
    TagsIndivisible {
        /// The requested cache line size, in bytes.
        cache_line_size: u32,
        /// The requested associativity.
        ways: u32,
        /// The requested tag width, in bits.
        tag_bits: u32,
    },
    /// `(cache_line_size * 8) / (ways * clock_bits)` did not divide evenly.
    CountsIndivisible {
        /// The requested cache line size, in bytes.
        cache_line_size: u32,
        /// The requested associativity.
        ways: u32,
        /// The requested counter width, in bits.
        clock_bits: u32,
    },
    /// `(cache_line_size * 8) / clock_hand_bits` did not divide evenly.
    ClockHandsIndivisible {
        /// The requested cache line size, in bytes.
        cache_line_size: u32,
        /// `log2(ways)`.
        clock_hand_bits: u32,
    },
    /// `size_of::<K>() > size_of::<V>()`.
    KeyLargerThanValue {
        /// `size_of::<K>()`.
        key_size: usize,
        /// `size_of::<V>()`.
        value_size: usize,
    },
    /// `size_of::<K>() >= cache_line_size`.
    KeyNotSmallerThanCacheLine {
        /// `size_of::<K>()`.
        key_size: usize,
        /// The requested cache line size, in bytes.
        cache_line_size: u32,
    },
    /// `cache_line_size` is not a multiple of `size_of::<K>()`.
    CacheLineNotMultipleOfKey {
        /// `size_of::<K>()`.
        key_size: usize,
        /// The requested cache line size, in bytes.
        cache_line_size: u32,
    },
    /// Neither `cache_line_size` is a multiple of `size_of::<V>()` nor vice
    /// versa.
    CacheLineValueMismatch {
        /// `size_of::<V>()`.
        value_size: usize,
        /// The requested cache line size, in bytes.
        cache_line_size: u32,
    },
    /// `value_alignment` was present but not a power of two; `std::alloc`
    /// requires power-of-two alignment, so this must be rejected here rather
    /// than surfacing as an allocator panic in `ValueArena::new`.
    ValueAlignmentNotPowerOfTwo {
        /// The requested alignment.
        requested: usize,
    },
    /// `value_alignment` was present but not strictly greater than `V`'s
    /// natural alignment.
    ValueAlignmentNotStrictlyGreater {
        /// The requested alignment.
        requested: usize,
        /// `align_of::<V>()`.
        natural: usize,
    },
    /// `value_alignment` was present but does not divide `size_of::<V>()`.
    ValueAlignmentDoesNotDivideSize {
        /// The requested alignment.
        requested: usize,
        /// `size_of::<V>()`.
        value_size: usize,
    },
    /// The requested capacity was zero, not a power of two, or smaller than
    /// `ways`.
    InvalidCapacity {
        /// The requested capacity.
        capacity: usize,
        /// The requested associativity.
        ways: u32,
    },
    /// `sets` is not large enough to fill, and is not an exact multiple of,
    /// the number of sets' worth of tags, counters, or clock hands that fit
    /// in one cache line -- violating invariant 5's "every arena is at least
    /// one cache line and a multiple of the cache line size."
    SetsNotCacheLineAligned {
        /// The derived set count (`capacity / ways`).
        sets: usize,
        /// Sets per cache line for the tags arena.
        tags_per_line: u32,
        /// Sets per cache line for the counts arena.
        clocks_per_line: u32,
        /// Sets per cache line for the clock-hand arena.
        clock_hands_per_line: u32,
    },
}

impl Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::InvalidWays(ways) => {
                write!(f, "ways must be one of {VALID_WAYS:?}, got {ways}")
            }
            LayoutError::InvalidTagBits(tag_bits) => {
                write!(f, "tag_bits must be one of {VALID_TAG_BITS:?}, got {tag_bits}")
            }
            LayoutError::InvalidClockBits(clock_bits) => write!(
                f,
                "clock_bits must be one of {VALID_CLOCK_BITS:?}, got {clock_bits}"
            ),
            LayoutError::InvalidClockHandBits(bits) => {
                write!(f, "log2(ways) must be 1, 2, or 4, got {bits}")
            }
            LayoutError::CacheLineNotPowerOfTwo(size) => {
                write!(f, "cache_line_size must be a power of two, got {size}")
            }
            LayoutError::TagsIndivisible {
                cache_line_size,
                ways,
                tag_bits,
            } => write!(
                f,
                "cache_line_size * 8 ({}) must be an exact multiple of ways * tag_bits ({})",
                *cache_line_size as u64 * 8,
                *ways as u64 * *tag_bits as u64
            ),
            LayoutError::CountsIndivisible {
                cache_line_size,
                ways,
                clock_bits,
            } => write!(
                f,
                "cache_line_size * 8 ({}) must be an exact multiple of ways * clock_bits ({})",
                *cache_line_size as u64 * 8,
                *ways as u64 * *clock_bits as u64
            ),
            LayoutError::ClockHandsIndivisible {
                cache_line_size,
                clock_hand_bits,
            } => write!(
                f,
                "cache_line_size * 8 ({}) must be an exact multiple of clock_hand_bits ({clock_hand_bits})",
                *cache_line_size as u64 * 8,
            ),
            LayoutError::KeyLargerThanValue {
                key_size,
                value_size,
            } => write!(
                f,
                "size_of::<K>() ({key_size}) must be <= size_of::<V>() ({value_size})"
            ),
            LayoutError::KeyNotSmallerThanCacheLine {
                key_size,
                cache_line_size,
            } => write!(
                f,
                "size_of::<K>() ({key_size}) must be < cache_line_size ({cache_line_size})"
            ),
            LayoutError::CacheLineNotMultipleOfKey {
                key_size,
                cache_line_size,
            } => write!(
                f,
                "cache_line_size ({cache_line_size}) must be a multiple of size_of::<K>() ({key_size})"
            ),
            LayoutError::CacheLineValueMismatch {
                value_size,
                cache_line_size,
            } => write!(
                f,
                "cache_line_size ({cache_line_size}) and size_of::<V>() ({value_size}) must be mutually divisible"
            ),
            LayoutError::ValueAlignmentNotPowerOfTwo { requested } => write!(
                f,
                "value_alignment ({requested}) must be a power of two"
            ),
            LayoutError::ValueAlignmentNotStrictlyGreater { requested, natural } => write!(
                f,
                "value_alignment ({requested}) must be strictly greater than size_of::<V>()'s natural alignment ({natural})"
            ),
            LayoutError::ValueAlignmentDoesNotDivideSize {
                requested,
                value_size,
            } => write!(
                f,
                "value_alignment ({requested}) must divide size_of::<V>() ({value_size})"
            ),
            LayoutError::InvalidCapacity { capacity, ways } => write!(
                f,
                "capacity ({capacity}) must be a power of two and at least ways ({ways})"
            ),
            LayoutError::SetsNotCacheLineAligned {
                sets,
                tags_per_line,
                clocks_per_line,
                clock_hands_per_line,
            } => write!(
                f,
                "sets ({sets}) must be a multiple of tags_per_line ({tags_per_line}), \
                 clocks_per_line ({clocks_per_line}), and clock_hands_per_line \
                 ({clock_hands_per_line}), so every arena is at least one cache line"
            ),
        }
    }
}

impl StdError for LayoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_layout() -> Layout {
        Layout::sixteen_way()
    }

    #[test]
    fn spec_scenario_layout_validates() {
        let geometry = scenario_layout().validate(8, 8, 8).unwrap();

        assert_eq!(geometry.clock_hand_bits, 4);
        assert_eq!(geometry.tags_per_line, 64 * 8 / (16 * 8));
        assert_eq!(geometry.max_count(), 3);
        assert_eq!(geometry.clock_sweep_bound(), 16 * 3 + 1);
    }

    #[test]
    fn rejects_non_power_of_two_ways() {
        let mut layout = scenario_layout();
        layout.ways = 3;
        assert_eq!(
            layout.validate(8, 8, 8),
            Err(LayoutError::InvalidWays(3))
        );
    }

    #[test]
    fn rejects_indivisible_cache_line() {
        let mut layout = scenario_layout();
        layout.cache_line_size = 63;
        assert_eq!(
            layout.validate(8, 8, 8),
            Err(LayoutError::CacheLineNotPowerOfTwo(63))
        );
    }

    #[test]
    fn rejects_key_larger_than_value() {
        let layout = scenario_layout();
        assert_eq!(
            layout.validate(16, 8, 8),
            Err(LayoutError::KeyLargerThanValue {
                key_size: 16,
                value_size: 8
            })
        );
    }

    #[test]
    fn rejects_misaligned_value_alignment() {
        let mut layout = scenario_layout();
        layout.value_alignment = Some(4);
        assert_eq!(
            layout.validate(8, 8, 8),
            Err(LayoutError::ValueAlignmentNotStrictlyGreater {
                requested: 4,
                natural: 8
            })
        );
    }

    #[test]
    fn rejects_non_power_of_two_value_alignment() {
        let mut layout = scenario_layout();
        // 24 is strictly greater than the natural align (8), divides the
        // value size (192), and 192 is a multiple of the cache line size
        // (64) -- every other precondition passes except power-of-twoness.
        layout.value_alignment = Some(24);
        assert_eq!(
            layout.validate(8, 192, 8),
            Err(LayoutError::ValueAlignmentNotPowerOfTwo { requested: 24 })
        );
    }

    #[test]
    fn accepts_strictly_greater_dividing_alignment() {
        let mut layout = scenario_layout();
        layout.value_alignment = Some(16);
        let geometry = layout.validate(8, 16, 8).unwrap();
        assert_eq!(geometry.value_alignment, 16);
    }
}
