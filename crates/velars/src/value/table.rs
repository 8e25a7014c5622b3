// Hybrid table: contiguous array part plus a closed-hashing node part.
//
// Non-negative integer keys are candidates for the array part; its size
// is the largest n such that more than half the slots 1..n are in use.
// The node part is a chained scatter table with Brent's variation: if an
// element is not in its main position, the colliding element there is in
// its own main position. Chains use signed relative offsets (0 ends the
// chain), so the node vector is plain-copyable on resize.

use ahash::RandomState;

use crate::gc::object_pool::Pool;
use crate::gc::string_table::VelaStr;
use crate::gc::TableId;
use crate::value::value::*;
use crate::vm::{runtime_error, VelaResult};

/// Largest array index is 2^MAXABITS.
const MAXABITS: usize = 31;
/// The node part may not exceed 2^MAXHBITS slots.
const MAXHBITS: usize = MAXABITS - 1;

/// Read-only view over the string pool, enough for key hashing and
/// long-string equality.
#[derive(Clone, Copy)]
pub(crate) struct Strings<'a> {
    pub pool: &'a Pool<VelaStr>,
    pub hasher: &'a RandomState,
}

impl<'a> Strings<'a> {
    #[inline]
    fn hash_of(&self, id: crate::gc::StrId) -> u64 {
        match self.pool.get(id.0) {
            Some(s) => s.data.hash(self.hasher),
            None => 0,
        }
    }

    #[inline]
    fn content_eq(&self, a: crate::gc::StrId, b: crate::gc::StrId) -> bool {
        match (self.pool.get(a.0), self.pool.get(b.0)) {
            (Some(x), Some(y)) => x.data.as_str() == y.data.as_str(),
            _ => false,
        }
    }
}

/// Raw equality as the table sees keys: numbers by mathematical value,
/// short strings by id, long strings by content, everything else by
/// identity.
pub(crate) fn raw_eq(a: &VelaValue, b: &VelaValue, strs: &Strings) -> bool {
    match (a.tag(), b.tag()) {
        (V_INT, V_INT) => a.as_integer() == b.as_integer(),
        (V_FLOAT, V_FLOAT) => a.as_float() == b.as_float(),
        (V_INT, V_FLOAT) => (a.int_value() as f64) == b.float_value(),
        (V_FLOAT, V_INT) => a.float_value() == (b.int_value() as f64),
        (V_LNGSTR, V_LNGSTR) => {
            let (x, y) = (a.str_id_value(), b.str_id_value());
            x == y || strs.content_eq(x, y)
        }
        (ta, tb) if ta == tb => a.raw_bits() == b.raw_bits(),
        _ => false,
    }
}

#[derive(Clone, Copy)]
pub(crate) struct Node {
    pub key: VelaValue,
    pub val: VelaValue,
    /// Relative offset to the next node in this chain; 0 terminates.
    pub next: i32,
}

impl Node {
    const EMPTY: Node = Node {
        key: VelaValue::nil(),
        val: VelaValue::nil(),
        next: 0,
    };
}

/// Where a key lives inside the table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Pos {
    Array(usize),
    Node(usize),
}

pub struct VelaTable {
    array: Vec<VelaValue>,
    /// Hash part; empty vector plays the role of the shared dummy node
    node: Vec<Node>,
    /// log2 of the node count when the hash part is non-empty
    lsizenode: u8,
    /// One past the last position not yet handed out; walks downward
    lastfree: usize,
    pub(crate) metatable: Option<TableId>,
    /// Bit i set: tag method i known absent. Any new key clears it.
    pub(crate) flags: u8,
}

#[inline]
fn ceil_log2(x: usize) -> usize {
    debug_assert!(x >= 1);
    if x == 1 { 0 } else { 64 - ((x - 1).leading_zeros() as usize) }
}

/// Hash for floats: split into mantissa and exponent, scale the
/// mantissa into the i32 range and fold the exponent in.
fn float_hash(n: f64) -> u64 {
    let (m, e) = frexp(n);
    let scaled = m * 2_147_483_648.0; // -(i32::MIN)
    if !scaled.is_finite() {
        return 0; // inf or NaN
    }
    let ni = scaled as i64;
    let u = (e as u32).wrapping_add(ni as u32);
    (if u <= i32::MAX as u32 { u } else { !u }) as u64
}

/// frexp: mantissa in [0.5, 1) and exponent with m * 2^e == x.
fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let raw_exp = ((bits >> 52) & 0x7FF) as i32;
    if raw_exp == 0 {
        // subnormal: rescale into the normal range first
        let (m, e) = frexp(x * 18_446_744_073_709_551_616.0); // 2^64
        (m, e - 64)
    } else {
        let m = f64::from_bits((bits & !(0x7FFu64 << 52)) | (1022u64 << 52));
        (m, raw_exp - 1022)
    }
}

/// Array-part candidate index of a key: k when the key is an integer
/// with 0 < k <= 2^MAXABITS, 0 otherwise.
#[inline]
fn array_index(key: &VelaValue) -> usize {
    if let Some(k) = key.as_integer() {
        if 0 < k && (k as u64) <= (1u64 << MAXABITS) {
            return k as usize;
        }
    }
    0
}

impl VelaTable {
    pub fn new() -> Self {
        VelaTable {
            array: Vec::new(),
            node: Vec::new(),
            lsizenode: 0,
            lastfree: 0,
            metatable: None,
            flags: !0,
        }
    }

    #[inline]
    pub(crate) fn is_dummy(&self) -> bool {
        self.node.is_empty()
    }

    #[inline]
    pub fn size_array(&self) -> usize {
        self.array.len()
    }

    #[inline]
    pub fn size_node(&self) -> usize {
        self.node.len()
    }

    pub fn metatable(&self) -> Option<TableId> {
        self.metatable
    }

    /// Bytes charged to the allocator for this table.
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<VelaTable>()
            + self.array.len() * std::mem::size_of::<VelaValue>()
            + self.node.len() * std::mem::size_of::<Node>()
    }

    pub(crate) fn array_slots(&self) -> &[VelaValue] {
        &self.array
    }

    pub(crate) fn array_slots_mut(&mut self) -> &mut [VelaValue] {
        &mut self.array
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.node
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.node
    }

    // ============ Main position ============

    /// The node a key hashes to before collision resolution. The hash
    /// part must be non-empty.
    pub(crate) fn main_position(&self, strs: &Strings, key: &VelaValue) -> usize {
        debug_assert!(!self.is_dummy());
        let size = self.node.len();
        let mask = size - 1;
        match key.tag() {
            V_INT => (key.int_value() as u64 as usize) & mask,
            V_FLOAT => Self::hash_mod(float_hash(key.float_value()), size),
            V_SHRSTR | V_LNGSTR => (strs.hash_of(key.str_id_value()) as usize) & mask,
            V_TRUE => 1 & mask,
            V_FALSE => 0,
            // raw bit patterns tend to have many factors of two, so use
            // modulo an odd divisor instead of masking
            V_LIGHTUD | V_LIGHTFN => Self::hash_mod(key.raw_bits(), size),
            _ => Self::hash_mod(key.raw_bits(), size),
        }
    }

    #[inline]
    fn hash_mod(h: u64, size: usize) -> usize {
        (h % (((size - 1) | 1) as u64)) as usize
    }

    #[inline]
    fn next_in_chain(&self, n: usize) -> Option<usize> {
        let nx = self.node[n].next;
        if nx == 0 { None } else { Some((n as isize + nx as isize) as usize) }
    }

    // ============ Lookup ============

    /// Specialized lookup for integer keys.
    pub fn get_int(&self, key: i64) -> VelaValue {
        if 1 <= key && (key as u64) <= self.array.len() as u64 {
            return self.array[(key - 1) as usize];
        }
        if self.is_dummy() {
            return VelaValue::nil();
        }
        let mask = self.node.len() - 1;
        let mut n = (key as u64 as usize) & mask;
        loop {
            let node = &self.node[n];
            if node.key.is_integer() && node.key.as_integer() == Some(key) {
                return node.val;
            }
            match self.next_in_chain(n) {
                Some(nx) => n = nx,
                None => return VelaValue::nil(),
            }
        }
    }

    /// Short strings compare by id while walking the chain.
    fn get_shortstr(&self, strs: &Strings, key: &VelaValue) -> VelaValue {
        debug_assert!(key.tag() == V_SHRSTR);
        if self.is_dummy() {
            return VelaValue::nil();
        }
        let mut n = self.main_position(strs, key);
        loop {
            let node = &self.node[n];
            if node.key.tag() == V_SHRSTR && node.key.str_id_value() == key.str_id_value() {
                return node.val;
            }
            match self.next_in_chain(n) {
                Some(nx) => n = nx,
                None => return VelaValue::nil(),
            }
        }
    }

    /// Generic chain walk with raw equality.
    fn get_generic(&self, strs: &Strings, key: &VelaValue) -> VelaValue {
        if self.is_dummy() {
            return VelaValue::nil();
        }
        let mut n = self.main_position(strs, key);
        loop {
            let node = &self.node[n];
            if raw_eq(&node.key, key, strs) {
                return node.val;
            }
            match self.next_in_chain(n) {
                Some(nx) => n = nx,
                None => return VelaValue::nil(),
            }
        }
    }

    /// Main lookup. Nil keys read as nil; a float key with an exact
    /// integer value is the integer key.
    pub(crate) fn get(&self, strs: &Strings, key: &VelaValue) -> VelaValue {
        match key.tag() {
            V_SHRSTR => self.get_shortstr(strs, key),
            V_INT => self.get_int(key.int_value()),
            V_NIL => VelaValue::nil(),
            V_FLOAT => {
                if let Some(i) = VelaValue::float_to_int_exact(key.float_value()) {
                    self.get_int(i)
                } else {
                    self.get_generic(strs, key)
                }
            }
            _ => self.get_generic(strs, key),
        }
    }

    /// Position of a key that is already present (its slot may hold
    /// nil). The key must be normalized.
    fn find_pos(&self, strs: &Strings, key: &VelaValue) -> Option<Pos> {
        if let Some(k) = key.as_integer() {
            if 1 <= k && (k as u64) <= self.array.len() as u64 {
                return Some(Pos::Array((k - 1) as usize));
            }
        }
        if self.is_dummy() {
            return None;
        }
        let mut n = self.main_position(strs, key);
        loop {
            if raw_eq(&self.node[n].key, key, strs) {
                return Some(Pos::Node(n));
            }
            n = self.next_in_chain(n)?;
        }
    }

    // ============ Insertion ============

    /// Walk `lastfree` downward looking for a node with a nil key.
    fn get_free_pos(&mut self) -> Option<usize> {
        while self.lastfree > 0 {
            self.lastfree -= 1;
            if self.node[self.lastfree].key.is_nil() {
                return Some(self.lastfree);
            }
        }
        None
    }

    /// Insert a fresh key and return its position; the caller stores the
    /// value. Assumes the key is normalized, non-nil and not NaN.
    fn new_key(&mut self, strs: &Strings, key: VelaValue) -> VelaResult<Pos> {
        self.flags = 0;
        if !self.is_dummy() {
            let mp = self.main_position(strs, &key);
            if self.node[mp].val.is_nil() {
                // free main position (possibly holding an invisible key)
                self.node[mp].key = key;
                return Ok(Pos::Node(mp));
            }
            let Some(f) = self.get_free_pos() else {
                return self.rehash_and_insert(strs, key);
            };
            let occupant = self.node[mp].key;
            let othern = self.main_position(strs, &occupant);
            if othern != mp {
                // the occupant is displaced: move it into the free node
                // and claim its spot for the new key
                let mut prev = othern;
                while (prev as isize + self.node[prev].next as isize) as usize != mp {
                    prev = (prev as isize + self.node[prev].next as isize) as usize;
                }
                self.node[prev].next = (f as isize - prev as isize) as i32;
                self.node[f] = self.node[mp];
                if self.node[mp].next != 0 {
                    self.node[f].next += (mp as isize - f as isize) as i32;
                    self.node[mp].next = 0;
                }
                self.node[mp].val = VelaValue::nil();
                self.node[mp].key = key;
                Ok(Pos::Node(mp))
            } else {
                // the occupant owns its main position: the new key goes
                // to the free node, prepended right after mp
                if self.node[mp].next != 0 {
                    self.node[f].next =
                        ((mp as isize + self.node[mp].next as isize) - f as isize) as i32;
                } else {
                    debug_assert_eq!(self.node[f].next, 0);
                }
                self.node[mp].next = (f as isize - mp as isize) as i32;
                self.node[f].key = key;
                Ok(Pos::Node(f))
            }
        } else {
            self.rehash_and_insert(strs, key)
        }
    }

    /// Grow the table for one more key, then place it.
    fn rehash_and_insert(&mut self, strs: &Strings, key: VelaValue) -> VelaResult<Pos> {
        self.rehash(strs, &key)?;
        if let Some(pos) = self.find_pos(strs, &key) {
            return Ok(pos); // landed in the grown array part
        }
        self.new_key(strs, key)
    }

    /// Store `value` under `key`, inserting the key if needed. Storing
    /// nil keeps the slot; the entry just becomes invisible.
    pub(crate) fn set(
        &mut self,
        strs: &Strings,
        key: VelaValue,
        value: VelaValue,
    ) -> VelaResult<()> {
        if key.is_nil() {
            return runtime_error("table index is nil");
        }
        if key.is_float() && key.float_value().is_nan() {
            return runtime_error("table index is NaN");
        }
        let key = key.normalize_key();
        let pos = match self.find_pos(strs, &key) {
            Some(pos) => pos,
            None => self.new_key(strs, key)?,
        };
        match pos {
            Pos::Array(i) => self.array[i] = value,
            Pos::Node(n) => self.node[n].val = value,
        }
        Ok(())
    }

    /// Specialized store for integer keys.
    pub(crate) fn set_int(
        &mut self,
        strs: &Strings,
        key: i64,
        value: VelaValue,
    ) -> VelaResult<()> {
        if 1 <= key && (key as u64) <= self.array.len() as u64 {
            self.array[(key - 1) as usize] = value;
            return Ok(());
        }
        self.set(strs, VelaValue::integer(key), value)
    }

    // ============ Rehash ============

    fn count_int(key: &VelaValue, nums: &mut [usize; MAXABITS + 1]) -> bool {
        let k = array_index(key);
        if k != 0 {
            nums[ceil_log2(k)] += 1;
            true
        } else {
            false
        }
    }

    /// Count used array slots into `nums[i]` (keys in (2^(i-1), 2^i]).
    fn count_array(&self, nums: &mut [usize; MAXABITS + 1]) -> usize {
        let mut ause = 0;
        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                nums[ceil_log2(i + 1)] += 1;
                ause += 1;
            }
        }
        ause
    }

    fn count_hash(&self, nums: &mut [usize; MAXABITS + 1], na: &mut usize) -> usize {
        let mut totaluse = 0;
        for n in &self.node {
            if !n.val.is_nil() {
                if Self::count_int(&n.key, nums) {
                    *na += 1;
                }
                totaluse += 1;
            }
        }
        totaluse
    }

    /// The optimal array size is the largest 2^i such that more than
    /// half of the slots 1..2^i would be in use. `na` enters with the
    /// number of integer keys and leaves with the number going to the
    /// array part.
    fn compute_sizes(nums: &[usize; MAXABITS + 1], na: &mut usize) -> usize {
        let mut a = 0; // elements smaller than 2^i
        let mut na_out = 0;
        let mut optimal = 0;
        let mut twotoi: usize = 1;
        let mut i = 0;
        while i <= MAXABITS && *na > twotoi / 2 {
            if nums[i] > 0 {
                a += nums[i];
                if a > twotoi / 2 {
                    optimal = twotoi;
                    na_out = a;
                }
            }
            i += 1;
            twotoi *= 2;
        }
        debug_assert!(optimal == 0 || (optimal / 2 < na_out && na_out <= optimal));
        *na = na_out;
        optimal
    }

    /// Histogram-driven resize restoring the >50% array occupancy
    /// invariant, counting `extra_key` as about to be inserted.
    pub(crate) fn rehash(&mut self, strs: &Strings, extra_key: &VelaValue) -> VelaResult<()> {
        let mut nums = [0usize; MAXABITS + 1];
        let mut na = self.count_array(&mut nums);
        let mut totaluse = na;
        totaluse += self.count_hash(&mut nums, &mut na);
        if Self::count_int(extra_key, &mut nums) {
            na += 1;
        }
        totaluse += 1;
        let asize = Self::compute_sizes(&nums, &mut na);
        self.resize(strs, asize, totaluse - na)
    }

    fn set_node_vector(&mut self, size: usize) -> VelaResult<()> {
        if size == 0 {
            self.node = Vec::new();
            self.lsizenode = 0;
            self.lastfree = 0;
            return Ok(());
        }
        let lsize = ceil_log2(size);
        if lsize > MAXHBITS {
            return runtime_error("table overflow");
        }
        let sz = 1usize << lsize;
        self.node = vec![Node::EMPTY; sz];
        self.lsizenode = lsize as u8;
        self.lastfree = sz; // all positions are free
        Ok(())
    }

    /// Resize both parts. A shrinking array re-inserts its surviving
    /// tail entries; they necessarily land in the hash part because the
    /// array size is lowered first.
    pub(crate) fn resize(
        &mut self,
        strs: &Strings,
        nasize: usize,
        nhsize: usize,
    ) -> VelaResult<()> {
        // validate the hash size before touching anything
        if nhsize > 0 && ceil_log2(nhsize) > MAXHBITS {
            return runtime_error("table overflow");
        }
        let oldasize = self.array.len();
        if nasize > oldasize {
            self.array.resize(nasize, VelaValue::nil());
        }
        let old_nodes = std::mem::take(&mut self.node);
        self.set_node_vector(nhsize)?;
        if nasize < oldasize {
            let tail = self.array.split_off(nasize);
            for (i, v) in tail.iter().enumerate() {
                if !v.is_nil() {
                    self.set_int(strs, (nasize + i + 1) as i64, *v)?;
                }
            }
        }
        for old in old_nodes.iter().rev() {
            if !old.val.is_nil() {
                self.set(strs, old.key, old.val)?;
            }
        }
        Ok(())
    }

    pub(crate) fn resize_array(&mut self, strs: &Strings, nasize: usize) -> VelaResult<()> {
        let nhsize = self.node.len();
        self.resize(strs, nasize, nhsize)
    }

    // ============ Length ============

    /// Search for `i`, `j` with `t[i]` non-nil and `t[j]` nil, then
    /// binary-search the boundary between them.
    fn unbound_search(&self, j0: u64) -> i64 {
        let mut i = j0;
        let mut j = j0 + 1;
        while !self.get_int(j as i64).is_nil() {
            i = j;
            if j > (i64::MAX as u64) / 2 {
                // table built for adversarial lengths: linear search
                let mut k = 1i64;
                while !self.get_int(k).is_nil() {
                    k += 1;
                }
                return k - 1;
            }
            j *= 2;
        }
        while j - i > 1 {
            let m = (i + j) / 2;
            if self.get_int(m as i64).is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i as i64
    }

    /// A boundary: an index n with `t[n]` non-nil and `t[n+1]` nil
    /// (0 when `t[1]` is nil). With interior nils any boundary may be
    /// returned.
    pub fn len(&self) -> i64 {
        let j = self.array.len();
        if j > 0 && self.array[j - 1].is_nil() {
            // boundary is inside the array part: binary search
            let mut i = 0usize;
            let mut j = j;
            while j - i > 1 {
                let m = (i + j) / 2;
                if self.array[m - 1].is_nil() {
                    j = m;
                } else {
                    i = m;
                }
            }
            return i as i64;
        }
        if self.is_dummy() {
            return j as i64;
        }
        self.unbound_search(j as u64)
    }

    // ============ Traversal ============

    /// Logical index of a key in the sequence array ++ nodes. Dead keys
    /// match by stored identity so traversal survives a collection.
    fn find_index(&self, strs: &Strings, key: &VelaValue) -> VelaResult<usize> {
        if key.is_nil() {
            return Ok(0); // first iteration
        }
        let key = key.normalize_key();
        let i = array_index(&key);
        if i != 0 && i <= self.array.len() {
            return Ok(i);
        }
        if self.is_dummy() {
            return runtime_error("invalid key to 'next'");
        }
        let mut n = self.main_position(strs, &key);
        loop {
            let node = &self.node[n];
            let found = raw_eq(&node.key, &key, strs)
                || (node.key.is_dead_key() && node.key.dead_key_matches(&key));
            if found {
                return Ok(n + 1 + self.array.len());
            }
            match self.next_in_chain(n) {
                Some(nx) => n = nx,
                None => return runtime_error("invalid key to 'next'"),
            }
        }
    }

    /// Next non-nil entry after `key` (nil starts the traversal). An
    /// entry whose value was set to nil is invisible.
    pub(crate) fn next(
        &self,
        strs: &Strings,
        key: &VelaValue,
    ) -> VelaResult<Option<(VelaValue, VelaValue)>> {
        let mut i = self.find_index(strs, key)?;
        while i < self.array.len() {
            if !self.array[i].is_nil() {
                return Ok(Some((VelaValue::integer(i as i64 + 1), self.array[i])));
            }
            i += 1;
        }
        let mut j = i - self.array.len();
        while j < self.node.len() {
            if !self.node[j].val.is_nil() {
                return Ok(Some((self.node[j].key, self.node[j].val)));
            }
            j += 1;
        }
        Ok(None)
    }
}

impl Default for VelaTable {
    fn default() -> Self {
        Self::new()
    }
}
