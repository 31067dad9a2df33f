use std::hash::Hasher as _;

use fnv::FnvHasher;

use crate::{
    bucket::Bucket,
    error::{DropReason, MAX_TABLE_CAPACITY_BITS, MIN_TABLE_CAPACITY_BITS},
};

/// Hashes an expanded metric name for table lookups.
pub(crate) fn hash_name(name: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish()
}

/// The bucket grid shared by every invocation of an aggregator.
///
/// Windows are half-open intervals `[start, start + interval)` where `start` is a multiple of the interval. A window is
/// due for flushing once `now >= start + expire`: it closed at `start + interval`, and late samples are still accepted
/// for the remaining `expire - interval` seconds.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Grid {
    interval: i64,
    expire: i64,
    bucket_count: usize,
}

impl Grid {
    pub fn new(interval: u32, expire: u32) -> Self {
        // Every window that is not yet due, the current one, one window into the future, and one more to absorb the
        // delay between a window becoming due and the worker getting to it.
        let bucket_count = expire.div_ceil(interval) as usize + 2;

        Self {
            interval: i64::from(interval),
            expire: i64::from(expire),
            bucket_count,
        }
    }

    /// A grid with an arbitrary bucket count, bypassing the one derived from `expire`.
    #[cfg(test)]
    pub const fn with_bucket_count(interval: u32, expire: u32, bucket_count: usize) -> Self {
        Self {
            interval: interval as i64,
            expire: expire as i64,
            bucket_count,
        }
    }

    pub const fn interval(&self) -> i64 {
        self.interval
    }

    pub const fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Aligns a timestamp to the start of the window containing it.
    pub const fn align(&self, timestamp: i64) -> i64 {
        timestamp - timestamp.rem_euclid(self.interval)
    }

    /// Ring slot holding the window starting at `start`.
    pub const fn slot(&self, start: i64) -> usize {
        start.div_euclid(self.interval).rem_euclid(self.bucket_count as i64) as usize
    }

    /// Total time covered by the ring.
    pub const fn span(&self) -> i64 {
        self.interval * self.bucket_count as i64
    }

    /// Start of the oldest window that is not yet due at `now`.
    pub const fn first_open_window(&self, now: i64) -> i64 {
        self.align(now - self.expire) + self.interval
    }

    /// Returns `true` if the window starting at `start` is due at `now`.
    ///
    /// That is `expire` seconds after the window started: its `interval`, then `expire - interval` seconds of grace for
    /// late samples.
    pub const fn is_due(&self, start: i64, now: i64) -> bool {
        start + self.expire <= now
    }

    /// The next instant, strictly after `now`, at which some window becomes due.
    pub const fn next_flush_after(&self, now: i64) -> i64 {
        self.first_open_window(now) + self.expire
    }
}

/// The live aggregation state of one expanded output name.
#[derive(Debug)]
pub(crate) struct Invocation {
    name: String,
    hash: u64,
    splay: i64,
    expire_at: i64,
    active: bool,
    floor: i64,
    buckets: Vec<Bucket>,
    next: Option<Box<Invocation>>,
}

impl Invocation {
    /// Creates a new invocation at `now`.
    ///
    /// `splay` is added to every expiry deadline of this invocation so that series created together do not all expire
    /// during the same sweep.
    ///
    /// Fails with [`DropReason::OutOfMemory`] if the bucket ring cannot be allocated.
    pub fn new(name: String, hash: u64, now: i64, splay: i64, grid: &Grid) -> Result<Self, DropReason> {
        let floor = grid.first_open_window(now);
        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(grid.bucket_count())
            .map_err(|_| DropReason::OutOfMemory)?;
        buckets.resize_with(grid.bucket_count(), || Bucket::new(0));
        for i in 0..grid.bucket_count() {
            let start = floor + i as i64 * grid.interval();
            buckets[grid.slot(start)].reset(start);
        }

        Ok(Self {
            name,
            hash,
            splay,
            expire_at: now + grid.expire + splay,
            active: false,
            floor,
            buckets,
            next: None,
        })
    }

    #[cfg(test)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub const fn expire_at(&self) -> i64 {
        self.expire_at
    }

    fn matches(&self, hash: u64, name: &str) -> bool {
        self.hash == hash && self.name == name
    }

    /// Returns `true` if no window holds any sample.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Bucket::is_empty)
    }

    /// Records a sample taken at `timestamp`, received at `now`.
    ///
    /// Nothing is modified when the sample is rejected.
    pub fn record(
        &mut self, now: i64, timestamp: i64, value: f64, keep_raw: bool, grid: &Grid,
    ) -> Result<(), DropReason> {
        // `floor` is aligned, so comparing the raw timestamp is equivalent and keeps `align` away from `i64::MIN`.
        if timestamp < self.floor {
            return Err(DropReason::TooOld);
        }
        let start = grid.align(timestamp);
        if start >= self.floor + grid.span() {
            return Err(DropReason::TooNew);
        }

        let bucket = &mut self.buckets[grid.slot(start)];
        debug_assert_eq!(bucket.start(), start);
        bucket.record(value, keep_raw).map_err(|_| DropReason::OutOfMemory)?;

        self.active = true;
        self.expire_at = now + grid.expire + self.splay;

        Ok(())
    }

    /// Flushes every window that is due at `now`, oldest first.
    ///
    /// `emit` is called with each non-empty bucket before it is reset. Flushed buckets move to the far end of the ring,
    /// ready for the window `span` seconds later.
    pub fn flush<F>(&mut self, now: i64, grid: &Grid, mut emit: F)
    where
        F: FnMut(&str, &mut Bucket),
    {
        let target = grid.first_open_window(now);
        let mut visited = 0;

        while self.floor < target {
            if visited == grid.bucket_count() {
                // Every slot has been flushed, so whatever lies between here and the target is empty: jump ahead.
                self.floor = target;
                for i in 0..grid.bucket_count() {
                    let start = target + i as i64 * grid.interval();
                    self.buckets[grid.slot(start)].reset(start);
                }
                break;
            }

            let bucket = &mut self.buckets[grid.slot(self.floor)];
            debug_assert!(grid.is_due(bucket.start(), now));
            if !bucket.is_empty() {
                emit(&self.name, bucket);
            }
            bucket.reset(self.floor + grid.span());

            self.floor += grid.interval();
            visited += 1;
        }
    }

    /// Decides whether this invocation can be reclaimed at `now`, and starts a new activity period otherwise.
    ///
    /// An invocation is reclaimed once its expiry deadline has passed, it saw no samples since the previous sweep, and
    /// none of its windows still hold unflushed samples.
    pub fn sweep(&mut self, now: i64) -> bool {
        let expired = !self.active && now > self.expire_at && self.is_empty();
        self.active = false;
        expired
    }
}

/// A fixed-capacity hash table of invocations.
///
/// The table is an array of `2^bits` chain heads, with collisions resolved by singly-linked chains owned by the table.
/// It never resizes: the capacity is a tunable sized for the expected number of distinct output names, and chains
/// simply grow longer beyond that.
#[derive(Debug)]
pub(crate) struct InvocationTable {
    slots: Box<[Option<Box<Invocation>>]>,
    mask: u64,
    len: usize,
}

impl InvocationTable {
    pub fn with_capacity_bits(bits: u8) -> Self {
        let bits = bits.clamp(MIN_TABLE_CAPACITY_BITS, MAX_TABLE_CAPACITY_BITS);
        let capacity = 1usize << bits;

        Self {
            slots: (0..capacity).map(|_| None).collect(),
            mask: capacity as u64 - 1,
            len: 0,
        }
    }

    fn slot_index(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    /// Number of chain heads.
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of invocations.
    pub const fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, hash: u64, name: &str) -> Option<&Invocation> {
        let mut current = self.slots[self.slot_index(hash)].as_deref();
        while let Some(invocation) = current {
            if invocation.matches(hash, name) {
                return Some(invocation);
            }
            current = invocation.next.as_deref();
        }
        None
    }

    pub fn get_mut(&mut self, hash: u64, name: &str) -> Option<&mut Invocation> {
        let idx = self.slot_index(hash);
        let mut current = self.slots[idx].as_deref_mut();
        while let Some(invocation) = current {
            if invocation.matches(hash, name) {
                return Some(invocation);
            }
            current = invocation.next.as_deref_mut();
        }
        None
    }

    /// Looks up an invocation, creating it with `create` if it does not exist yet.
    ///
    /// Returns the invocation, and whether it was created by this call. If `create` fails, the table is left unchanged
    /// and its error is returned.
    pub fn try_get_or_insert_with<F, E>(
        &mut self, hash: u64, name: &str, create: F,
    ) -> Result<(&mut Invocation, bool), E>
    where
        F: FnOnce() -> Result<Invocation, E>,
    {
        if self.get(hash, name).is_some() {
            let invocation = self.get_mut(hash, name).expect("invocation was just found");
            return Ok((invocation, false));
        }

        let mut invocation = Box::new(create()?);
        debug_assert!(invocation.matches(hash, name));

        let idx = self.slot_index(hash);
        invocation.next = self.slots[idx].take();
        self.len += 1;
        let invocation = self.slots[idx].insert(invocation);
        Ok((&mut **invocation, true))
    }

    /// Unlinks and returns the invocation with the given name.
    pub fn remove(&mut self, hash: u64, name: &str) -> Option<Box<Invocation>> {
        let mut removed = None;
        let idx = self.slot_index(hash);
        self.relink(idx, |invocation| {
            if removed.is_none() && invocation.matches(hash, name) {
                removed = Some(invocation);
                None
            } else {
                Some(invocation)
            }
        });
        removed
    }

    /// Visits every invocation, unlinking those for which `keep` returns `false`.
    ///
    /// Returns the number of invocations removed.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&mut Invocation) -> bool,
    {
        let mut removed = 0;
        for idx in 0..self.slots.len() {
            self.relink(idx, |mut invocation| {
                if keep(&mut invocation) {
                    Some(invocation)
                } else {
                    removed += 1;
                    None
                }
            });
        }
        removed
    }

    /// Takes the chain at `idx` apart and links back every invocation `f` hands back.
    fn relink<F>(&mut self, idx: usize, mut f: F)
    where
        F: FnMut(Box<Invocation>) -> Option<Box<Invocation>>,
    {
        let mut remaining = self.slots[idx].take();
        let mut tail = &mut self.slots[idx];

        while let Some(mut invocation) = remaining {
            remaining = invocation.next.take();
            match f(invocation) {
                Some(kept) => tail = &mut tail.insert(kept).next,
                None => self.len -= 1,
            }
        }
    }

    /// Iterates over every invocation, in no particular order.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &Invocation> {
        self.slots.iter().flat_map(|head| {
            let mut current = head.as_deref();
            std::iter::from_fn(move || {
                let invocation = current?;
                current = invocation.next.as_deref();
                Some(invocation)
            })
        })
    }
}

impl Drop for InvocationTable {
    fn drop(&mut self) {
        // Unlink chains one node at a time, so that dropping a long chain does not recurse once per node.
        for head in self.slots.iter_mut() {
            let mut current = head.take();
            while let Some(mut invocation) = current {
                current = invocation.next.take();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: u32 = 60;
    const EXPIRE: u32 = 120;
    const T0: i64 = 1_700_000_040; // multiple of 60

    fn grid() -> Grid {
        Grid::new(INTERVAL, EXPIRE)
    }

    fn new_invocation(name: &str, now: i64) -> Result<Invocation, DropReason> {
        Invocation::new(name.to_string(), hash_name(name), now, 0, &grid())
    }

    fn invocation(name: &str, now: i64) -> Invocation {
        new_invocation(name, now).unwrap()
    }

    #[test]
    fn grid_alignment() {
        let grid = grid();
        assert_eq!(T0 % 60, 0);
        assert_eq!(grid.bucket_count(), 4);
        assert_eq!(grid.align(T0), T0);
        assert_eq!(grid.align(T0 + 59), T0);
        assert_eq!(grid.align(T0 + 60), T0 + 60);
        assert_eq!(grid.align(-1), -60);
        assert_eq!(grid.slot(-60), 3);
        assert_eq!(grid.span(), 240);

        // A window starting at T0 becomes due at T0 + expire.
        assert!(!grid.is_due(T0, T0 + 119));
        assert!(grid.is_due(T0, T0 + 120));
        assert_eq!(grid.first_open_window(T0 + 119), T0);
        assert_eq!(grid.first_open_window(T0 + 120), T0 + 60);
        assert_eq!(grid.next_flush_after(T0 + 100), T0 + 120);
        assert_eq!(grid.next_flush_after(T0 + 120), T0 + 180);
    }

    #[test]
    fn bucket_count_covers_uneven_expiry() {
        assert_eq!(Grid::new(60, 60).bucket_count(), 3);
        assert_eq!(Grid::new(60, 75).bucket_count(), 4);
        assert_eq!(Grid::new(10, 95).bucket_count(), 12);
    }

    #[test]
    fn new_invocation_ring_is_contiguous() {
        let grid = grid();
        let invocation = invocation("a", T0 + 5);

        // Oldest open window at T0 + 5 with a 120s expiry is T0 - 60.
        assert_eq!(invocation.floor, T0 - 60);
        let mut starts = invocation.buckets.iter().map(Bucket::start).collect::<Vec<_>>();
        starts.sort_unstable();
        assert_eq!(starts, vec![T0 - 60, T0, T0 + 60, T0 + 120]);
        for bucket in invocation.buckets.iter() {
            assert_eq!(invocation.buckets[grid.slot(bucket.start())].start(), bucket.start());
        }
    }

    #[test]
    fn record_rejects_samples_outside_ring() {
        let grid = grid();
        let mut invocation = invocation("a", T0 + 5);

        assert_eq!(
            invocation.record(T0 + 5, T0 - 61, 1.0, false, &grid),
            Err(DropReason::TooOld)
        );
        assert_eq!(
            invocation.record(T0 + 5, T0 + 180, 1.0, false, &grid),
            Err(DropReason::TooNew)
        );
        assert!(invocation.is_empty());
        assert!(!invocation.active);

        invocation.record(T0 + 5, T0 - 60, 1.0, false, &grid).unwrap();
        invocation.record(T0 + 5, T0 + 179, 1.0, false, &grid).unwrap();
        assert!(!invocation.is_empty());
        assert!(invocation.active);
        assert_eq!(invocation.expire_at(), T0 + 5 + 120);
    }

    #[test]
    fn flush_emits_due_windows_in_order() {
        let grid = grid();
        let mut invocation = invocation("a", T0);
        invocation.record(T0, T0, 1.0, false, &grid).unwrap();
        invocation.record(T0, T0 + 60, 2.0, false, &grid).unwrap();

        let mut flushed = Vec::new();
        invocation.flush(T0 + 180, &grid, |name, bucket| {
            flushed.push((name.to_string(), bucket.start(), bucket.sum()))
        });
        assert_eq!(
            flushed,
            vec![("a".to_string(), T0, 1.0), ("a".to_string(), T0 + 60, 2.0)]
        );
        assert_eq!(invocation.floor, T0 + 120);
        assert!(invocation.is_empty());

        // Flushing again at the same time finds nothing new.
        let mut count = 0;
        invocation.flush(T0 + 180, &grid, |_, _| count += 1);
        assert_eq!(count, 0);
        assert_eq!(invocation.floor, T0 + 120);
    }

    #[test]
    fn flush_after_long_gap_jumps_ahead() {
        let grid = grid();
        let mut invocation = invocation("a", T0);
        invocation.record(T0, T0, 1.0, false, &grid).unwrap();

        let mut count = 0;
        let later = T0 + 100_000 * 60;
        invocation.flush(later, &grid, |_, _| count += 1);
        assert_eq!(count, 1);
        assert_eq!(invocation.floor, grid.first_open_window(later));

        // The ring is usable again right away.
        invocation.record(later, later, 3.0, false, &grid).unwrap();
    }

    #[test]
    fn sweep_requires_idle_expired_and_empty() {
        let grid = grid();
        let mut invocation = invocation("a", T0);
        invocation.record(T0, T0, 1.0, false, &grid).unwrap();

        // Active since last sweep.
        assert!(!invocation.sweep(T0 + 1000));
        // Expired and idle, but still holding data.
        assert!(!invocation.sweep(T0 + 1000));

        invocation.flush(T0 + 1000, &grid, |_, _| {});
        assert!(!invocation.sweep(T0 + 120));
        assert!(invocation.sweep(T0 + 121));
    }

    #[test]
    fn table_insert_lookup_and_remove() {
        // Two slots, to force chaining.
        let mut table = InvocationTable::with_capacity_bits(1);
        assert_eq!(table.capacity(), 2);

        let names = ["a", "b", "c", "d", "e"];
        for name in names {
            let hash = hash_name(name);
            let (inserted, created) = table.try_get_or_insert_with(hash, name, || new_invocation(name, T0)).unwrap();
            assert!(created);
            assert_eq!(inserted.name(), name);
        }
        assert_eq!(table.len(), 5);

        for name in names {
            let hash = hash_name(name);
            let (existing, created) = table
                .try_get_or_insert_with::<_, DropReason>(hash, name, || panic!("should exist"))
                .unwrap();
            assert!(!created);
            assert_eq!(existing.name(), name);
            assert!(table.get(hash, name).is_some());
        }
        assert_eq!(table.len(), 5);

        let removed = table.remove(hash_name("c"), "c").unwrap();
        assert_eq!(removed.name(), "c");
        assert!(table.remove(hash_name("c"), "c").is_none());
        assert!(table.get(hash_name("c"), "c").is_none());
        assert_eq!(table.len(), 4);

        let mut remaining = table.iter().map(|i| i.name().to_string()).collect::<Vec<_>>();
        remaining.sort();
        assert_eq!(remaining, vec!["a", "b", "d", "e"]);
    }

    #[test]
    fn table_distinguishes_equal_hashes() {
        let mut table = InvocationTable::with_capacity_bits(4);
        table
            .try_get_or_insert_with(7, "x", || Invocation::new("x".to_string(), 7, T0, 0, &grid()))
            .unwrap();
        table
            .try_get_or_insert_with(7, "y", || Invocation::new("y".to_string(), 7, T0, 0, &grid()))
            .unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(7, "x").map(Invocation::name), Some("x"));
        assert_eq!(table.get(7, "y").map(Invocation::name), Some("y"));
        assert!(table.get(7, "z").is_none());
    }

    #[test]
    fn unallocatable_ring_is_reported() {
        let grid = Grid::with_bucket_count(INTERVAL, EXPIRE, usize::MAX);
        let result = Invocation::new("x".to_string(), hash_name("x"), T0, 0, &grid);
        assert!(matches!(result, Err(DropReason::OutOfMemory)));
    }

    #[test]
    fn table_failed_creation_inserts_nothing() {
        let mut table = InvocationTable::with_capacity_bits(4);
        let result = table.try_get_or_insert_with(hash_name("x"), "x", || Err(DropReason::OutOfMemory));

        assert!(matches!(result, Err(DropReason::OutOfMemory)));
        assert_eq!(table.len(), 0);
        assert!(table.get(hash_name("x"), "x").is_none());
    }

    #[test]
    fn record_rejects_extreme_timestamps() {
        let grid = grid();
        let mut invocation = invocation("x", T0);

        assert_eq!(invocation.record(T0, i64::MIN, 1.0, false, &grid), Err(DropReason::TooOld));
        assert_eq!(invocation.record(T0, i64::MIN + 1, 1.0, false, &grid), Err(DropReason::TooOld));
        assert_eq!(invocation.record(T0, i64::MAX, 1.0, false, &grid), Err(DropReason::TooNew));
        assert!(invocation.is_empty());
    }

    #[test]
    fn table_retain_unlinks() {
        let mut table = InvocationTable::with_capacity_bits(1);
        for i in 0..50 {
            let name = format!("m{}", i);
            table
                .try_get_or_insert_with(hash_name(&name), &name, || new_invocation(&name, T0))
                .unwrap();
        }

        let removed = table.retain(|invocation| invocation.name().len() == 2);
        assert_eq!(removed, 40);
        assert_eq!(table.len(), 10);
        assert_eq!(table.iter().count(), 10);
        for i in 0..10 {
            let name = format!("m{}", i);
            assert!(table.get_mut(hash_name(&name), &name).is_some());
        }
    }
}
