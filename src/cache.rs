//! The set-associative CLOCK cache: the user-facing structure built on top
//! of [`PackedIntArray`], [`BitMaskIterator`], and [`Geometry`].

use crate::bitmask::BitMaskIterator;
use crate::geometry::{Geometry, Layout, LayoutError};
use crate::packed::PackedIntArray;
use std::alloc::{self, Layout as AllocLayout};
use std::fmt::{self, Debug};
use std::mem::{self, MaybeUninit};
use std::ptr::{self, NonNull};

/// The external collaborators a [`SetAssociativeCache`] needs in order to
/// operate over a particular `(Key, Value)` pairing.
///
/// Implement this on a small marker type per cache instantiation -- it plays
/// the same role here that the `Cache` and `MemoryModule` traits play
/// elsewhere in this codebase: an explicit, monomorphizable seam rather than
/// a blanket `Hash + Eq` bound on `Key` itself. That matters because a cache
/// may want a different hash than the one `Key`'s own `Hash` impl would
/// produce (good avalanche across the whole 64 bits, not just enough
/// distribution for a `HashMap`'s bucket count).
pub trait KeyValue {
    /// The key type used to look entries up.
    type Key;
    /// The value type stored in the cache.
    type Value;

    /// Extracts the key a stored value was inserted under.
    fn key_from_value(value: &Self::Value) -> Self::Key;
    /// Hashes a key to a 64-bit digest with good avalanche across all bits;
    /// both the set index and the tag are carved out of this single hash.
    fn hash(key: &Self::Key) -> u64;
    /// Key equality, used to disambiguate tag collisions within a set.
    fn equal(a: &Self::Key, b: &Self::Key) -> bool;
}

/// Owns a contiguous, possibly over-aligned allocation of `len` values, each
/// starting out uninitialized.
///
/// A slot's [`MaybeUninit<V>`] only holds a live `V` while the corresponding
/// `counts` slot in the owning [`SetAssociativeCache`] is non-zero; this
/// mirrors invariant 6 of the specification ("a slot is occupied iff its
/// counter is non-zero") extended to Rust's initialization tracking. Reading
/// or dropping a slot while its counter is zero is undefined behavior.
struct ValueArena<V> {
    ptr: NonNull<MaybeUninit<V>>,
    len: usize,
    layout: AllocLayout,
}

impl<V> ValueArena<V> {
    fn new(len: usize, alignment: usize) -> Self {
        let elem = AllocLayout::new::<V>();
        let align = elem.align().max(alignment);
        let size = elem
            .size()
            .checked_mul(len)
            .expect("value arena size overflowed usize");
        let layout =
            AllocLayout::from_size_align(size, align).expect("invalid value arena layout");

        let ptr = if size == 0 {
            NonNull::dangling()
        } else {
            // SAFETY: `layout` has non-zero size, as checked above.
            let raw = unsafe { alloc::alloc(layout) } as *mut MaybeUninit<V>;
            match NonNull::new(raw) {
                Some(ptr) => ptr,
                None => alloc::handle_alloc_error(layout),
            }
        };

        Self { ptr, len, layout }
    }

    fn as_slice(&self) -> &[MaybeUninit<V>] {
        // SAFETY: `ptr` is valid for `len` elements for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [MaybeUninit<V>] {
        // SAFETY: `ptr` is valid for `len` elements for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<V> Drop for ValueArena<V> {
    fn drop(&mut self) {
        // Individual elements are dropped explicitly by the owning cache
        // (via `drop_occupied`) before this runs; this only reclaims the
        // raw bytes.
        if self.layout.size() != 0 {
            // SAFETY: `ptr`/`layout` match the allocation made in `new`.
            unsafe { alloc::dealloc(self.ptr.as_ptr() as *mut u8, self.layout) }
        }
    }
}

impl<V> Debug for ValueArena<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueArena")
            .field("len", &self.len)
            .field("align", &self.layout.align())
            .finish()
    }
}

/// A fixed-capacity, key-indexed value cache with approximate-LRU (CLOCK)
/// eviction and per-insertion pinning.
///
/// Parameterized by a [`KeyValue`] implementation `KV`, which supplies the
/// hash, key-equality, and key-extraction functions the cache needs; see the
/// module documentation for why these are a trait rather than bounds on
/// `KV::Key` directly.
///
/// Construction (`new`) is the only fallible operation -- it validates the
/// requested [`Layout`] and capacity before allocating anything. Every other
/// operation is total: `get`/`remove`/`put_no_clobber*` never fail at
/// runtime once the cache exists, matching the specification's failure
/// semantics.
pub struct SetAssociativeCache<KV: KeyValue> {
    geometry: Geometry,
    sets: usize,
    tags: PackedIntArray,
    counts: PackedIntArray,
    clocks: PackedIntArray,
    values: ValueArena<KV::Value>,
}

impl<KV: KeyValue> SetAssociativeCache<KV> {
    /// Allocates a cache with room for `capacity` values, shaped by `layout`.
    ///
    /// `capacity` must be a power of two and at least `layout.ways`; `sets =
    /// capacity / layout.ways` is then automatically a power of two too,
    /// since both operands are powers of two. Every other precondition is
    /// checked by [`Layout::validate`].
    ///
    /// Returns a [`LayoutError`] before allocating anything if the
    /// configuration is invalid -- this crate never panics on untrusted
    /// configuration data.
    pub fn new(layout: Layout, capacity: usize) -> Result<Self, LayoutError> {
        let key_size = mem::size_of::<KV::Key>();
        let value_size = mem::size_of::<KV::Value>();
        let value_align = mem::align_of::<KV::Value>();

        let geometry = layout.validate(key_size, value_size, value_align)?;

        if capacity == 0 || !capacity.is_power_of_two() || capacity < geometry.ways as usize {
            return Err(LayoutError::InvalidCapacity {
                capacity,
                ways: geometry.ways,
            });
        }

        let sets = capacity / geometry.ways as usize;
        debug_assert!(sets.is_power_of_two());

        if sets % geometry.tags_per_line as usize != 0
            || sets % geometry.clocks_per_line as usize != 0
            || sets % geometry.clock_hands_per_line as usize != 0
        {
            return Err(LayoutError::SetsNotCacheLineAligned {
                sets,
                tags_per_line: geometry.tags_per_line,
                clocks_per_line: geometry.clocks_per_line,
                clock_hands_per_line: geometry.clock_hands_per_line,
            });
        }

        Ok(Self {
            tags: PackedIntArray::new(capacity, geometry.tag_bits),
            counts: PackedIntArray::new(capacity, geometry.clock_bits),
            clocks: PackedIntArray::new(sets, geometry.clock_hand_bits),
            values: ValueArena::new(capacity, geometry.value_alignment),
            sets,
            geometry,
        })
    }

    /// The derived, validated layout constants this cache was built with.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Total slot count (`sets * ways`).
    pub fn capacity(&self) -> usize {
        self.sets * self.geometry.ways as usize
    }

    /// The number of sets (`capacity / ways`).
    pub fn sets(&self) -> usize {
        self.sets
    }

    /// Empties the cache without freeing its arenas.
    ///
    /// Any value currently occupying a slot is dropped in place first, so
    /// callers with `Drop`-bearing `V` don't leak; the specification's
    /// "value bytes unspecified" language becomes, in Rust, "every slot
    /// reverts to uninitialized."
    pub fn reset(&mut self) {
        self.drop_occupied();
        self.tags.clear();
        self.counts.clear();
        self.clocks.clear();
    }

    fn drop_occupied(&mut self) {
        for idx in 0..self.capacity() {
            if self.counts.get(idx) > 0 {
                // SAFETY: count > 0 means this slot holds a live `V`
                // (invariant 6), and we only do this once per slot before
                // the count is about to be zeroed.
                unsafe { ptr::drop_in_place(self.values.as_mut_slice()[idx].as_mut_ptr()) };
            }
        }
    }

    /// Computes `(tag, set_index, offset)` for `key`: the set index and tag
    /// are carved out of disjoint bit ranges of the same 64-bit hash.
    fn associate(&self, key: &KV::Key) -> (u64, usize, usize) {
        let h = KV::hash(key);
        let log2_sets = self.sets.trailing_zeros();
        let set_index = (h as usize) & (self.sets - 1);
        let tag_mask = (1u64 << self.geometry.tag_bits) - 1;
        let tag = (h >> log2_sets) & tag_mask;
        let offset = set_index * self.geometry.ways as usize;

        (tag, set_index, offset)
    }

    /// Produces a `ways`-bit mask with bit `w` set iff `tags[offset + w] ==
    /// tag`. Written as a fixed-trip-count, branch-free loop over independent
    /// iterations so the optimizer can auto-vectorize it into the SIMD
    /// equality splat the specification calls for; a `std::simd` port would
    /// replace this loop body one-for-one without touching callers.
    fn tag_match_bitmask(&self, offset: usize, tag: u64) -> u32 {
        let ways = self.geometry.ways as usize;
        let mut mask = 0u32;

        for w in 0..ways {
            mask |= ((self.tags.get(offset + w) == tag) as u32) << w;
        }

        mask
    }

    /// Finds the way within the set at `offset` holding `key`, if any.
    ///
    /// Tag collisions are tolerated: every candidate with a matching tag is
    /// checked against `counts` (to filter free slots, whose tags are not
    /// authoritative) and then against `key` itself.
    fn search(&self, offset: usize, tag: u64, key: &KV::Key) -> Option<usize> {
        let mask = self.tag_match_bitmask(offset, tag);

        for w in BitMaskIterator::new(mask) {
            let idx = offset + w;
            if self.counts.get(idx) > 0 {
                // SAFETY: count > 0 means this slot holds a live `V`.
                let value = unsafe { self.values.as_slice()[idx].assume_init_ref() };
                if KV::equal(&KV::key_from_value(value), key) {
                    return Some(w);
                }
            }
        }

        None
    }

    /// Looks up `key`. On a hit, saturate-increments the slot's reference
    /// counter and returns a borrowed reference to the value; the returned
    /// reference is invalidated by the next mutating call on this cache. On
    /// a miss, returns `None` without mutating tags, clocks, or values.
    pub fn get(&mut self, key: &KV::Key) -> Option<&KV::Value> {
        let (tag, _set_index, offset) = self.associate(key);
        let w = self.search(offset, tag, key)?;
        let idx = offset + w;

        let count = self.counts.get(idx);
        let max = self.geometry.max_count();
        if count < max {
            self.counts.set(idx, count + 1);
        }

        // SAFETY: `search` only returns ways with count > 0.
        Some(unsafe { self.values.as_slice()[idx].assume_init_ref() })
    }

    /// Removes `key` if present, freeing its slot. A no-op on a miss,
    /// including a second `remove` of an already-removed key.
    pub fn remove(&mut self, key: &KV::Key) {
        let (tag, _set_index, offset) = self.associate(key);
        if let Some(w) = self.search(offset, tag, key) {
            let idx = offset + w;
            // SAFETY: `search` only returns ways with count > 0.
            unsafe { ptr::drop_in_place(self.values.as_mut_slice()[idx].as_mut_ptr()) };
            self.counts.set(idx, 0);
        }
    }

    /// Selects a slot for `key` via unpinned CLOCK sweep and returns it,
    /// uninitialized, for the caller to write into.
    ///
    /// The caller must guarantee `key` is not already present; violating
    /// this is checked with a `debug_assert` (fatal in debug/test builds,
    /// the caller's contract in release builds), per the specification's
    /// precondition-error policy.
    pub fn put_no_clobber(&mut self, key: &KV::Key) -> &mut MaybeUninit<KV::Value> {
        self.put_no_clobber_pinned(key, |_| false)
    }

    /// Like [`put_no_clobber`](Self::put_no_clobber), but `pinned` is
    /// consulted for every way the CLOCK hand visits, including free ones;
    /// a way for which `pinned` returns `true` is skipped without its
    /// counter being decremented.
    ///
    /// `pinned` receives `&MaybeUninit<KV::Value>` rather than `&KV::Value`:
    /// a way the hand visits may currently be free (uninitialized), and the
    /// specification's recommended pinning strategy -- comparing pointer
    /// identity against a value the caller already holds a live reference to
    /// -- never needs to read through the pointer, so this keeps the API
    /// sound without requiring every visited slot to hold a valid `V`.
    ///
    /// The caller must guarantee fewer than `ways` keys are pinned in any
    /// one set; violating this trips the same CLOCK-sweep safety bound as a
    /// corrupted counter array (`ways * (2^clock_bits - 1) + 1` iterations),
    /// which is fatal.
    pub fn put_no_clobber_pinned(
        &mut self,
        key: &KV::Key,
        pinned: impl Fn(&MaybeUninit<KV::Value>) -> bool,
    ) -> &mut MaybeUninit<KV::Value> {
        let (tag, set_index, offset) = self.associate(key);
        debug_assert!(
            self.search(offset, tag, key).is_none(),
            "put_no_clobber called on an already-present key"
        );

        let ways = self.geometry.ways as usize;
        let max_iterations = self.geometry.clock_sweep_bound();
        let mut hand = self.clocks.get(set_index) as usize;
        let mut iterations = 0u64;
        let selected;

        loop {
            assert!(
                iterations < max_iterations,
                "CLOCK sweep exceeded its safety bound ({max_iterations} iterations); \
                 counts are corrupted or too many ways are pinned in this set"
            );
            iterations += 1;

            let idx = offset + hand;

            if pinned(&self.values.as_slice()[idx]) {
                // Skip without decrementing -- this way stays occupied.
            } else {
                let count = self.counts.get(idx);
                if count == 0 {
                    selected = hand;
                    break;
                }

                let new_count = count - 1;
                self.counts.set(idx, new_count);

                if new_count == 0 {
                    // SAFETY: count was > 0 before this decrement, so the
                    // slot held a live value; it is about to be overwritten.
                    unsafe {
                        ptr::drop_in_place(self.values.as_mut_slice()[idx].as_mut_ptr())
                    };
                    selected = hand;
                    break;
                }
            }

            hand = (hand + 1) % ways;
        }

        self.clocks.set(set_index, ((selected + 1) % ways) as u64);
        let slot = offset + selected;
        self.tags.set(slot, tag);
        self.counts.set(slot, 1);

        &mut self.values.as_mut_slice()[slot]
    }
}

impl<KV: KeyValue> SetAssociativeCache<KV>
where
    KV::Value: Debug,
{
    /// Dumps per-set state (tag, offset, clock hand, tags, values, counts)
    /// to the `log` crate's trace sink. Purely diagnostic; never called by
    /// any other operation in this module.
    pub fn inspect(&self) {
        let ways = self.geometry.ways as usize;

        for set_index in 0..self.sets {
            let offset = set_index * ways;
            let hand = self.clocks.get(set_index);

            log::trace!("set {set_index} (offset={offset}, clock_hand={hand})");

            for w in 0..ways {
                let idx = offset + w;
                let count = self.counts.get(idx);
                let tag = self.tags.get(idx);

                if count > 0 {
                    // SAFETY: count > 0 means this slot holds a live `V`.
                    let value = unsafe { self.values.as_slice()[idx].assume_init_ref() };
                    log::trace!("  way {w}: tag={tag} count={count} value={value:?}");
                } else {
                    log::trace!("  way {w}: tag={tag} count=0 (free)");
                }
            }
        }
    }
}

impl<KV: KeyValue> Drop for SetAssociativeCache<KV> {
    fn drop(&mut self) {
        self.drop_occupied();
    }
}

impl<KV: KeyValue> Debug for SetAssociativeCache<KV> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetAssociativeCache")
            .field("geometry", &self.geometry)
            .field("sets", &self.sets)
            .field("values", &self.values)
            .finish()
    }
}
