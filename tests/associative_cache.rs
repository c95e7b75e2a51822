use libclock::cache::KeyValue;
use libclock::geometry::{Layout, LayoutError};
use libclock::SetAssociativeCache;
use rand::{
    distributions::{Distribution, Uniform},
    SeedableRng,
};
use rand_chacha::ChaCha8Rng as Rng;
use std::mem::MaybeUninit;

/// The identity `u64 -> u64` cache used throughout the specification's
/// worked scenarios: `hash`, `key_from_value`, and `equal` are all trivial,
/// which keeps the arithmetic in each scenario easy to check by hand.
struct IdentityU64;

impl KeyValue for IdentityU64 {
    type Key = u64;
    type Value = u64;

    fn key_from_value(value: &u64) -> u64 {
        *value
    }

    fn hash(key: &u64) -> u64 {
        *key
    }

    fn equal(a: &u64, b: &u64) -> bool {
        a == b
    }
}

/// `ways=16, tag_bits=8, clock_bits=2, cache_line_size=64` over the
/// identity `u64` key/value pair, with `capacity = 2048` (`sets = 128`).
fn scenario_cache() -> SetAssociativeCache<IdentityU64> {
    SetAssociativeCache::new(Layout::sixteen_way(), 2048).unwrap()
}

fn insert(cache: &mut SetAssociativeCache<IdentityU64>, key: u64) {
    let slot = cache.put_no_clobber(&key);
    slot.write(key);
}

#[test]
fn miss_then_hit() {
    let mut cache = scenario_cache();

    assert_eq!(cache.get(&123), None);

    insert(&mut cache, 123);

    assert_eq!(cache.get(&123), Some(&123));
}

/// All sixteen keys `i * 128` hash to the same set (their low 7 bits are
/// zero), and to sixteen distinct tags (`i` fits in the tag's 8 bits), so
/// the whole set fills without a single eviction.
#[test]
fn fill_one_set() {
    let mut cache = scenario_cache();

    for i in 0..16u64 {
        assert_eq!(cache.geometry().ways, 16);
        insert(&mut cache, i * 128);
    }

    for i in 0..16u64 {
        assert_eq!(cache.get(&(i * 128)), Some(&(i * 128)));
    }

    // A second round of gets saturates every counter at 2 (well below the
    // clock_bits=2 maximum of 3) without disturbing any slot's identity.
    for i in 0..16u64 {
        assert_eq!(cache.get(&(i * 128)), Some(&(i * 128)));
    }
}

/// Filling a set and then inserting a seventeenth key evicts exactly the
/// entry the CLOCK hand was pointing at -- key `0`, which was written first.
#[test]
fn eviction_of_way_zero() {
    let mut cache = scenario_cache();

    for i in 0..16u64 {
        insert(&mut cache, i * 128);
    }
    for i in 0..16u64 {
        cache.get(&(i * 128));
    }

    insert(&mut cache, 16 * 128);

    assert_eq!(cache.get(&0), None);
    assert_eq!(cache.get(&(16 * 128)), Some(&(16 * 128)));
}

/// Pinning the just-inserted key forces the CLOCK sweep to skip it even
/// though it holds the highest reference count in the set, evicting a
/// lower-count but unpinned neighbor instead.
#[test]
fn pin_forces_eviction_of_highest_count_slot() {
    let mut cache = scenario_cache();

    for i in 0..16u64 {
        insert(&mut cache, i * 128);
    }
    for i in 0..16u64 {
        cache.get(&(i * 128));
    }
    insert(&mut cache, 16 * 128);
    // `16 * 128` now sits at count 1; bump it to 2, the highest in the set.
    cache.get(&(16 * 128));

    let pinned_value = 16 * 128u64;
    let slot = cache.put_no_clobber_pinned(&(17 * 128), |value: &MaybeUninit<u64>| {
        // SAFETY: every way the CLOCK hand visits here is occupied --
        // the set is full at this point in the scenario.
        unsafe { *value.assume_init_ref() } != pinned_value
    });
    slot.write(17 * 128);

    assert_eq!(cache.get(&(16 * 128)), None);
    assert_eq!(cache.get(&(17 * 128)), Some(&(17 * 128)));
}

/// `remove` frees the slot immediately, and a repeated `remove` is a no-op.
#[test]
fn remove_is_idempotent() {
    let mut cache = scenario_cache();

    for i in 0..16u64 {
        insert(&mut cache, i * 128);
    }

    cache.remove(&(5 * 128));
    assert_eq!(cache.get(&(5 * 128)), None);

    // Second removal of an already-free key changes nothing.
    cache.remove(&(5 * 128));
    assert_eq!(cache.get(&(5 * 128)), None);

    // The freed slot is immediately reusable without tripping the CLOCK
    // sweep's "already present" debug assertion.
    insert(&mut cache, 5 * 128 + 1);
    assert_eq!(cache.get(&(5 * 128 + 1)), Some(&(5 * 128 + 1)));
}

/// `reset` empties every set; a key inserted and retrieved beforehand is
/// gone afterward, and inserting it again behaves like a cold cache.
#[test]
fn reset_empties_the_cache() {
    let mut cache = scenario_cache();

    for i in 0..16u64 {
        insert(&mut cache, i * 128);
        cache.get(&(i * 128));
    }

    cache.reset();

    for i in 0..16u64 {
        assert_eq!(cache.get(&(i * 128)), None);
    }

    insert(&mut cache, 0);
    assert_eq!(cache.get(&0), Some(&0));
}

/// A `Layout` with an associativity that isn't a power of two (let alone one
/// of the three supported values) is rejected before any arena is
/// allocated -- `SetAssociativeCache::new` never panics on bad config data.
#[test]
fn rejects_invalid_layout_before_allocating() {
    let mut layout = Layout::sixteen_way();
    layout.ways = 3;

    let result = SetAssociativeCache::<IdentityU64>::new(layout, 2048);
    assert_eq!(result.err(), Some(LayoutError::InvalidWays(3)));
}

/// A capacity that isn't a power of two, or is smaller than `ways`, is
/// likewise rejected.
#[test]
fn rejects_invalid_capacity() {
    let result = SetAssociativeCache::<IdentityU64>::new(Layout::sixteen_way(), 2000);
    assert!(matches!(result, Err(LayoutError::InvalidCapacity { .. })));

    let result = SetAssociativeCache::<IdentityU64>::new(Layout::sixteen_way(), 8);
    assert!(matches!(result, Err(LayoutError::InvalidCapacity { .. })));
}

/// A capacity that is a power of two and at least `ways` can still leave an
/// arena under one cache line -- `sets=1` here fits only 1/16th of a tags
/// cache line -- and must be rejected rather than silently accepted.
#[test]
fn rejects_capacity_below_one_cache_line() {
    let layout = Layout {
        ways: 2,
        tag_bits: 16,
        clock_bits: 4,
        cache_line_size: 64,
        value_alignment: None,
    };

    let result = SetAssociativeCache::<IdentityU64>::new(layout, 2);
    assert!(matches!(
        result,
        Err(LayoutError::SetsNotCacheLineAligned { sets: 1, .. })
    ));
}

/// Associativity property: keys spread across many distinct sets (via a
/// non-colliding stride) are all retrievable with no eviction pressure.
#[test]
fn associativity_holds_without_eviction_pressure() {
    let mut cache = scenario_cache();
    let sets = cache.sets() as u64;

    // One key per set (the key's low bits select the set directly), landing
    // on way 0 of each; well under the 16-way capacity of every individual
    // set.
    let keys: Vec<u64> = (0..sets).collect();

    for &key in &keys {
        insert(&mut cache, key);
    }
    for &key in &keys {
        assert_eq!(cache.get(&key), Some(&key));
    }
}

/// CLOCK progress property, exercised with a pseudo-random workload: for a
/// run of insertions that overfill every set, `put_no_clobber` always
/// terminates (it would panic past the safety bound otherwise) and the
/// cache never exceeds its configured capacity of live entries.
#[test]
fn clock_sweep_makes_progress_under_random_overfill() {
    let mut cache = scenario_cache();
    let mut rng = Rng::seed_from_u64(42);
    let set_dist = Uniform::new(0u64, cache.sets() as u64);

    let mut failures = 0;
    let runs = 4096;

    for run in 0..runs {
        // Push far more than 16 keys through set 0's stride so the CLOCK
        // hand is forced around multiple times per run.
        let set = set_dist.sample(&mut rng);
        let tag = run % 200; // deliberately overfills the 16-way set
        let key = set + tag * cache.sets() as u64;

        if cache.get(&key).is_none() {
            insert(&mut cache, key);
        }

        if cache.get(&key) != Some(&key) {
            failures += 1;
        }
    }

    assert_eq!(failures, 0, "every freshly-inserted key must be retrievable");
}

/// `inspect` is purely diagnostic and must never panic or disturb cache
/// state, whether sets are empty, partially filled, or full.
#[test]
fn inspect_does_not_disturb_state() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut cache = scenario_cache();
    cache.inspect();

    for i in 0..16u64 {
        insert(&mut cache, i * 128);
    }
    cache.inspect();

    for i in 0..16u64 {
        assert_eq!(cache.get(&(i * 128)), Some(&(i * 128)));
    }
}
