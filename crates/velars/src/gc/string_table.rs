// String objects and the short-string interning table.
//
// Short strings are interned: one object per distinct content, equality
// is id equality. Long strings skip interning and hash lazily on first
// use. The intern table is open hashing over pool ids; it doubles when
// full and shrinks at the end of a GC cycle when under a quarter used.

use std::cell::Cell;
use std::hash::{BuildHasher, Hash, Hasher};

use ahash::RandomState;

use crate::gc::header::GcHeader;
use crate::gc::object_pool::Pool;
use crate::gc::StrId;

/// Immutable string object with a memoized hash.
pub struct VelaStr {
    data: Box<str>,
    hash: Cell<u64>,
    hashed: Cell<bool>,
    short: bool,
}

impl VelaStr {
    pub(crate) fn new_short(s: &str, hash: u64) -> Self {
        VelaStr {
            data: s.into(),
            hash: Cell::new(hash),
            hashed: Cell::new(true),
            short: true,
        }
    }

    pub(crate) fn new_long(s: &str) -> Self {
        VelaStr {
            data: s.into(),
            hash: Cell::new(0),
            hashed: Cell::new(false),
            short: false,
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn is_short(&self) -> bool {
        self.short
    }

    /// Memoized hash; long strings compute it on first use.
    #[inline]
    pub fn hash(&self, hasher: &RandomState) -> u64 {
        if !self.hashed.get() {
            self.hash.set(hash_str(hasher, &self.data));
            self.hashed.set(true);
        }
        self.hash.get()
    }

    /// Hash as stored, without forcing computation (interned strings
    /// always have one).
    #[inline]
    pub(crate) fn stored_hash(&self) -> u64 {
        debug_assert!(self.hashed.get());
        self.hash.get()
    }

    /// Bytes charged to the allocator for this object.
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<VelaStr>() + self.data.len()
    }
}

#[inline]
fn hash_str(hasher: &RandomState, s: &str) -> u64 {
    let mut h = hasher.build_hasher();
    s.hash(&mut h);
    h.finish()
}

const MIN_STRTAB_SIZE: usize = 64;

// API string cache geometry: N buckets, M entries each.
const STRCACHE_N: usize = 53;
const STRCACHE_M: usize = 2;

#[derive(Clone, Copy)]
struct CacheEntry {
    ptr: usize,
    len: usize,
    id: StrId,
}

pub struct StringTable {
    /// Power-of-two bucket vector over interned short strings
    buckets: Vec<Vec<StrId>>,
    /// Number of interned strings
    nuse: usize,
    /// Strings longer than this are long strings
    pub short_limit: usize,
    hasher: RandomState,
    /// Cache for embedder literals, keyed by source address. Cleared
    /// every GC cycle so it never holds a condemned id.
    cache: [[Option<CacheEntry>; STRCACHE_M]; STRCACHE_N],
}

impl StringTable {
    pub fn new(seed: u64, short_limit: usize) -> Self {
        StringTable {
            buckets: vec![Vec::new(); MIN_STRTAB_SIZE],
            nuse: 0,
            short_limit,
            hasher: RandomState::with_seed(seed as usize),
            cache: [[None; STRCACHE_M]; STRCACHE_N],
        }
    }

    #[inline]
    pub fn hash_of(&self, s: &str) -> u64 {
        hash_str(&self.hasher, s)
    }

    #[inline]
    pub fn hasher(&self) -> &RandomState {
        &self.hasher
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn nuse(&self) -> usize {
        self.nuse
    }

    /// Probe for an interned string with this content. A hit that was
    /// condemned in the current cycle is resurrected.
    pub fn find(
        &self,
        pool: &mut Pool<VelaStr>,
        s: &str,
        hash: u64,
        current_white: u8,
    ) -> Option<StrId> {
        let mask = self.buckets.len() - 1;
        let bucket = &self.buckets[(hash as usize) & mask];
        for &id in bucket {
            let Some(obj) = pool.get_mut(id.0) else {
                continue;
            };
            if obj.data.as_str() == s {
                let other = GcHeader::other_white(current_white);
                if obj.header.is_dead(other) {
                    obj.header.make_white(current_white);
                }
                return Some(id);
            }
        }
        None
    }

    /// Insert a new short string; the caller has already checked `find`
    /// and charged the allocator.
    pub fn insert_short(
        &mut self,
        pool: &mut Pool<VelaStr>,
        current_white: u8,
        s: &str,
        hash: u64,
    ) -> StrId {
        let str_obj = VelaStr::new_short(s, hash);
        let size = str_obj.byte_size() as u32;
        let id = StrId(pool.alloc(GcHeader::with_white(current_white, size), str_obj));
        let mask = self.buckets.len() - 1;
        self.buckets[(hash as usize) & mask].push(id);
        self.nuse += 1;
        if self.nuse >= self.buckets.len() && self.buckets.len() <= usize::MAX / 2 {
            self.resize(pool, self.buckets.len() * 2);
        }
        id
    }

    /// Rebuild the bucket vector at a new power-of-two size.
    pub fn resize(&mut self, pool: &Pool<VelaStr>, new_size: usize) {
        debug_assert!(new_size.is_power_of_two());
        let mut buckets = vec![Vec::new(); new_size];
        let mask = new_size - 1;
        for bucket in &self.buckets {
            for &id in bucket {
                if let Some(obj) = pool.get(id.0) {
                    buckets[(obj.data.stored_hash() as usize) & mask].push(id);
                }
            }
        }
        self.buckets = buckets;
    }

    /// End-of-cycle shrink: halve while under a quarter used.
    pub fn shrink_if_sparse(&mut self, pool: &Pool<VelaStr>) {
        while self.nuse < self.buckets.len() / 4 && self.buckets.len() > MIN_STRTAB_SIZE {
            let half = self.buckets.len() / 2;
            self.resize(pool, half);
        }
    }

    /// Drop a swept string from its bucket.
    pub fn remove(&mut self, id: StrId, hash: u64) {
        let mask = self.buckets.len() - 1;
        let bucket = &mut self.buckets[(hash as usize) & mask];
        let before = bucket.len();
        bucket.retain(|&i| i != id);
        debug_assert_eq!(before, bucket.len() + 1);
        self.nuse -= 1;
    }

    // ============ API string cache ============

    #[inline]
    pub fn cache_get(&self, pool: &Pool<VelaStr>, s: &str) -> Option<StrId> {
        let ptr = s.as_ptr() as usize;
        let row = &self.cache[ptr % STRCACHE_N];
        for entry in row.iter().flatten() {
            // the address may have been reused for other content
            if entry.ptr == ptr
                && entry.len == s.len()
                && pool.get(entry.id.0).map(|o| o.data.as_str() == s) == Some(true)
            {
                return Some(entry.id);
            }
        }
        None
    }

    #[inline]
    pub fn cache_put(&mut self, s: &str, id: StrId) {
        let ptr = s.as_ptr() as usize;
        let row = &mut self.cache[ptr % STRCACHE_N];
        row[1] = row[0];
        row[0] = Some(CacheEntry { ptr, len: s.len(), id });
    }

    /// Invalidated wholesale at the atomic phase; entries may name
    /// strings about to be swept.
    pub fn clear_cache(&mut self) {
        self.cache = [[None; STRCACHE_M]; STRCACHE_N];
    }
}
