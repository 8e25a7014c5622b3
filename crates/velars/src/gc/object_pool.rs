// Id-based object pools.
//
// Every collectable object lives in the pool for its kind, addressed by
// a u32 id. An IndexMap keeps iteration O(live objects) while the free
// list recycles ids so values embedding them stay small.

use ahash::RandomState;
use indexmap::IndexMap;

use crate::gc::gc_id::*;
use crate::gc::header::GcHeader;
use crate::gc::string_table::VelaStr;
use crate::value::{VelaClosure, VelaTable, VelaUpvalue, VelaUserdata};
use crate::vm::VelaState;

pub struct GcBox<T> {
    pub header: GcHeader,
    pub data: T,
}

pub struct Pool<T> {
    map: IndexMap<u32, GcBox<T>, RandomState>,
    free_list: Vec<u32>,
    next_id: u32,
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Self {
            map: IndexMap::with_hasher(RandomState::new()),
            free_list: Vec::new(),
            next_id: 0,
        }
    }

    /// Insert an object and hand back its id, recycling freed ids first.
    #[inline]
    pub fn alloc(&mut self, header: GcHeader, data: T) -> u32 {
        let id = if let Some(free_id) = self.free_list.pop() {
            free_id
        } else {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            debug_assert!(self.next_id != 0, "pool exhausted u32 ids");
            id
        };
        self.map.insert(id, GcBox { header, data });
        id
    }

    #[inline(always)]
    pub fn get(&self, id: u32) -> Option<&GcBox<T>> {
        self.map.get(&id)
    }

    #[inline(always)]
    pub fn get_mut(&mut self, id: u32) -> Option<&mut GcBox<T>> {
        self.map.get_mut(&id)
    }

    #[inline(always)]
    pub fn contains(&self, id: u32) -> bool {
        self.map.contains_key(&id)
    }

    /// Remove an object, returning it so the caller can run kind-specific
    /// teardown (upvalue unref, string table removal, ...).
    #[inline]
    pub fn free(&mut self, id: u32) -> Option<GcBox<T>> {
        let obj = self.map.swap_remove(&id)?;
        self.free_list.push(id);
        Some(obj)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &GcBox<T>)> + '_ {
        self.map.iter().map(|(&id, obj)| (id, obj))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut GcBox<T>)> + '_ {
        self.map.iter_mut().map(|(&id, obj)| (id, obj))
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// All heap objects of one state, split by kind so borrows of different
/// kinds never conflict.
pub struct ObjectPool {
    pub strings: Pool<VelaStr>,
    pub tables: Pool<VelaTable>,
    pub closures: Pool<VelaClosure>,
    pub upvals: Pool<VelaUpvalue>,
    pub userdata: Pool<VelaUserdata>,
    pub threads: Pool<VelaState>,
}

impl ObjectPool {
    pub fn new() -> Self {
        Self {
            strings: Pool::new(),
            tables: Pool::new(),
            closures: Pool::new(),
            upvals: Pool::new(),
            userdata: Pool::new(),
            threads: Pool::new(),
        }
    }

    pub fn header(&self, id: GcId) -> Option<&GcHeader> {
        match id {
            GcId::Str(i) => self.strings.get(i.0).map(|o| &o.header),
            GcId::Table(i) => self.tables.get(i.0).map(|o| &o.header),
            GcId::Closure(i) => self.closures.get(i.0).map(|o| &o.header),
            GcId::Upval(i) => self.upvals.get(i.0).map(|o| &o.header),
            GcId::Userdata(i) => self.userdata.get(i.0).map(|o| &o.header),
            GcId::Thread(i) => self.threads.get(i.0).map(|o| &o.header),
        }
    }

    pub fn header_mut(&mut self, id: GcId) -> Option<&mut GcHeader> {
        match id {
            GcId::Str(i) => self.strings.get_mut(i.0).map(|o| &mut o.header),
            GcId::Table(i) => self.tables.get_mut(i.0).map(|o| &mut o.header),
            GcId::Closure(i) => self.closures.get_mut(i.0).map(|o| &mut o.header),
            GcId::Upval(i) => self.upvals.get_mut(i.0).map(|o| &mut o.header),
            GcId::Userdata(i) => self.userdata.get_mut(i.0).map(|o| &mut o.header),
            GcId::Thread(i) => self.threads.get_mut(i.0).map(|o| &mut o.header),
        }
    }

    /// Total number of live objects across all kinds.
    pub fn live_objects(&self) -> usize {
        self.strings.len()
            + self.tables.len()
            + self.closures.len()
            + self.upvals.len()
            + self.userdata.len()
            + self.threads.len()
    }
}

impl Default for ObjectPool {
    fn default() -> Self {
        Self::new()
    }
}
