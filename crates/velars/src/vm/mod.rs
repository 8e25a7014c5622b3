// Global state.
//
// A `VelaVM` is one embedded runtime instance: object pools, string
// store, collector, registry and per-type metatables. Several instances
// may coexist; nothing here is process-global. All operations against
// one instance are single-threaded by construction (&mut self).
//
// Embedding contract: collectable values passed into or received from
// the API must be anchored (on a thread stack, in the registry, or in a
// reachable table) before the next allocating call, or a collection
// step may reclaim them.

mod call_info;
mod error;
mod options;
mod state;

pub use call_info::{call_status, CallInfo};
pub use error::{runtime_error, VelaError, VelaResult};
pub use options::VelaOptions;
pub use state::{ThreadStatus, VelaState};

use std::rc::Rc;

use log::warn;

use crate::gc::{
    Gc, GcCtx, GcHeader, GcId, ObjectPool, StrId, StringTable, TableId, ThreadId, UpvalId,
};
use crate::mem::{Allocator, DefaultAllocator};
use crate::value::table::Strings;
use crate::value::{
    NativeFn, Proto, UpvalState, VelaClosure, VelaTable, VelaUpvalue, VelaUserdata, VelaValue,
    NUM_TYPES, T_TABLE, T_USERDATA, V_FALSE, V_FLOAT, V_INT, V_LNGSTR, V_NATIVECL, V_NIL,
    V_SCRIPTCL, V_SHRSTR, V_TABLE, V_TRUE, V_USERDATA,
};

/// Tag methods resolvable through metatables. The first six cache
/// their absence in the metatable's flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum TagMethod {
    Index = 0,
    NewIndex = 1,
    Gc = 2,
    Mode = 3,
    Len = 4,
    Eq = 5,
    Call = 6,
}

pub const TM_COUNT: usize = 7;
const TM_CACHED: usize = 6;

const TM_NAMES: [&str; TM_COUNT] = [
    "__index",
    "__newindex",
    "__gc",
    "__mode",
    "__len",
    "__eq",
    "__call",
];

pub type PanicFn = fn(&VelaError);

pub struct VelaVM {
    pub(crate) pool: ObjectPool,
    pub(crate) strt: StringTable,
    pub(crate) gc: Gc,
    alloc: Box<dyn Allocator>,
    pub(crate) registry: VelaValue,
    main_thread: ThreadId,
    /// Metatables for non-table, non-userdata types
    basic_mt: [Option<TableId>; NUM_TYPES],
    tm_names: [StrId; TM_COUNT],
    #[allow(dead_code)]
    seed: u64,
    panic: Option<PanicFn>,
    options: VelaOptions,
    initialized: bool,
    protect_depth: usize,
}

impl VelaVM {
    pub fn new(options: VelaOptions) -> VelaVM {
        Self::with_allocator(options, Box::new(DefaultAllocator))
            .expect("default allocator never refuses")
    }

    /// Build a state with an embedder allocator hook. Fails only if the
    /// hook refuses the fundamental allocations.
    pub fn with_allocator(
        options: VelaOptions,
        alloc: Box<dyn Allocator>,
    ) -> VelaResult<VelaVM> {
        let seed: u64 = rand::random();
        let mut vm = VelaVM {
            pool: ObjectPool::new(),
            strt: StringTable::new(seed, options.short_string_limit),
            gc: Gc::new(options.gc_pause, options.gc_stepmul),
            alloc,
            registry: VelaValue::nil(),
            main_thread: ThreadId(0),
            basic_mt: [None; NUM_TYPES],
            tm_names: [StrId(0); TM_COUNT],
            seed,
            panic: None,
            options,
            initialized: false,
            protect_depth: 0,
        };
        vm.gc.running = false; // no collections while bootstrapping
        // main thread, pinned forever
        let th = VelaState::new(vm.options.initial_stack_size, vm.options.max_stack_size);
        let size = th.byte_size();
        vm.mem_charge(0, size)?;
        let tid = ThreadId(
            vm.pool
                .threads
                .alloc(GcHeader::with_white(0, size as u32), th),
        );
        vm.main_thread = tid;
        vm.gc.link_allgc(GcId::Thread(tid));
        {
            let VelaVM { gc, pool, .. } = &mut vm;
            gc.fix_object(GcId::Thread(tid), pool);
        }
        // fundamental strings, pinned
        for i in 0..TM_COUNT {
            let sid = vm.new_string_id(TM_NAMES[i])?;
            vm.tm_names[i] = sid;
            let VelaVM { gc, pool, .. } = &mut vm;
            gc.fix_object(GcId::Str(sid), pool);
        }
        // registry: [1] = main thread, [2] = globals table
        let registry = vm.new_table()?;
        vm.registry = registry;
        let main_val = VelaValue::thread(tid);
        vm.table_set_int(registry, 1, main_val)?;
        let globals = vm.new_table()?;
        vm.table_set_int(registry, 2, globals)?;

        vm.initialized = true;
        vm.gc.running = true;
        vm.gc.set_debt(0);
        Ok(vm)
    }

    // ============ Memory ============

    /// The single allocation funnel: account the byte delta and give
    /// the hook its veto. A refused growth triggers one emergency
    /// collection and one retry.
    fn mem_charge(&mut self, old_size: usize, new_size: usize) -> VelaResult<()> {
        if new_size > old_size
            && self.options.hardened_alloc
            && self.initialized
            && self.gc.running
        {
            self.full_gc_internal(false);
        }
        if !self.alloc.realloc(old_size, new_size) && new_size > old_size {
            if self.initialized {
                self.full_gc_internal(true);
                if !self.alloc.realloc(old_size, new_size) {
                    return Err(VelaError::OutOfMemory);
                }
            } else {
                return Err(VelaError::OutOfMemory);
            }
        }
        self.gc.total_bytes = self
            .gc
            .total_bytes
            .saturating_add(new_size)
            .saturating_sub(old_size);
        self.gc.debt += new_size as isize - old_size as isize;
        Ok(())
    }

    fn with_gc_ctx<R>(&mut self, f: impl FnOnce(&mut Gc, &mut GcCtx) -> R) -> R {
        let VelaVM {
            pool,
            strt,
            gc,
            alloc,
            registry,
            main_thread,
            basic_mt,
            tm_names,
            initialized,
            ..
        } = self;
        let mode_str = if *initialized {
            Some(tm_names[TagMethod::Mode as usize])
        } else {
            None
        };
        let mut ctx = GcCtx {
            pool,
            strt,
            alloc: alloc.as_mut(),
            main_thread: *main_thread,
            registry: *registry,
            basic_mt: *basic_mt,
            mode_str,
        };
        f(gc, &mut ctx)
    }

    /// Advance the collector when debt has accrued.
    #[inline]
    fn check_gc(&mut self) {
        if self.gc.running && self.gc.debt > 0 {
            self.gc_step();
        }
    }

    /// Run one burst of collector steps.
    pub fn gc_step(&mut self) {
        let pending = self.with_gc_ctx(|gc, ctx| gc.step(ctx));
        self.run_finalizers(pending);
    }

    /// Run a complete collection cycle.
    pub fn gc_collect(&mut self) {
        self.full_gc_internal(false);
    }

    /// Run a complete collection cycle, optionally in emergency mode
    /// (no finalizers, no string-table resize).
    pub fn gc_full(&mut self, emergency: bool) {
        self.full_gc_internal(emergency);
    }

    fn full_gc_internal(&mut self, emergency: bool) {
        let pending = self.with_gc_ctx(|gc, ctx| gc.full(ctx, emergency));
        self.run_finalizers(pending);
    }

    pub fn gc_stop(&mut self) {
        self.gc.running = false;
    }

    pub fn gc_restart(&mut self) {
        self.gc.running = true;
        self.gc.set_debt(0);
    }

    /// Set the inter-cycle pause percentage, returning the old value.
    pub fn set_gc_pause(&mut self, pause: i32) -> i32 {
        std::mem::replace(&mut self.gc.pause, pause)
    }

    /// Set the step multiplier percentage, returning the old value.
    pub fn set_gc_stepmul(&mut self, stepmul: i32) -> i32 {
        std::mem::replace(&mut self.gc.stepmul, stepmul)
    }

    /// Live bytes as observed through the allocator hook.
    pub fn total_bytes(&self) -> usize {
        self.gc.total_bytes
    }

    pub fn gc_debt(&self) -> isize {
        self.gc.debt
    }

    pub fn gc_stats(&self) -> &crate::gc::GcStats {
        &self.gc.stats
    }

    // ============ Finalizers ============

    /// Queue an object for finalization once it becomes unreachable.
    /// Objects without a `__gc` metamethod are left alone. Finalizers
    /// run in reverse registration order.
    pub fn register_finalizable(&mut self, obj: VelaValue) -> VelaResult<()> {
        let Some(id) = obj.gc_id() else {
            return runtime_error("value is not collectable");
        };
        if self.get_metamethod(obj, TagMethod::Gc).is_none() {
            return Ok(());
        }
        let finalized = self
            .pool
            .header(id)
            .map(|h| h.is_finalized())
            .unwrap_or(true);
        if finalized {
            return Ok(());
        }
        // list surgery needs the allgc sweep out of the way
        self.with_gc_ctx(|gc, ctx| gc.finish_allgc_sweep(ctx));
        let VelaVM { gc, pool, .. } = self;
        gc.move_to_finobj(id, pool);
        Ok(())
    }

    fn run_finalizers(&mut self, pending: Vec<GcId>) {
        if pending.is_empty() {
            return;
        }
        let prev = self.gc.stopem;
        self.gc.stopem = true;
        for id in pending {
            self.call_finalizer(id);
            // the object is no longer rooted by the collector
            self.gc.finalizing.retain(|&x| x != id);
        }
        self.gc.stopem = prev;
    }

    fn call_finalizer(&mut self, id: GcId) {
        let obj = self.id_to_value(id);
        let Some(fin) = self.get_metamethod(obj, TagMethod::Gc) else {
            return;
        };
        let callee: Option<NativeFn> = fin.as_light_fn().or_else(|| {
            fin.as_closure_id()
                .and_then(|cid| self.pool.closures.get(cid.0))
                .and_then(|c| c.data.native_fn())
        });
        let Some(f) = callee else {
            warn!(target: "velars::gc", "skipping non-native finalizer");
            return;
        };
        let thread = self.main_thread;
        let saved_top = match self.pool.threads.get(thread.0) {
            Some(t) => t.data.top(),
            None => return,
        };
        if self.push(thread, obj).is_err() {
            return;
        }
        let r = self.call_native_with_status(thread, f, 1, call_status::CIST_FIN);
        if let Err(e) = r {
            warn!(target: "velars::gc", "error in finalizer: {}", e);
        }
        if let Some(t) = self.pool.threads.get_mut(thread.0) {
            t.data.set_top(saved_top);
        }
    }

    fn id_to_value(&self, id: GcId) -> VelaValue {
        match id {
            GcId::Str(sid) => {
                let short = self
                    .pool
                    .strings
                    .get(sid.0)
                    .map(|s| s.data.is_short())
                    .unwrap_or(true);
                VelaValue::string(sid, short)
            }
            GcId::Table(tid) => VelaValue::table(tid),
            GcId::Closure(cid) => {
                let scripted = self
                    .pool
                    .closures
                    .get(cid.0)
                    .map(|c| c.data.is_scripted())
                    .unwrap_or(false);
                VelaValue::closure(cid, scripted)
            }
            GcId::Upval(_) => VelaValue::nil(),
            GcId::Userdata(uid) => VelaValue::userdata(uid),
            GcId::Thread(tid) => VelaValue::thread(tid),
        }
    }

    // ============ Strings ============

    fn new_string_id(&mut self, s: &str) -> VelaResult<StrId> {
        if s.len() <= self.strt.short_limit {
            self.check_gc();
            if let Some(id) = self.strt.cache_get(&self.pool.strings, s) {
                return Ok(id);
            }
            let hash = self.strt.hash_of(s);
            let cw = self.gc.current_white;
            if let Some(id) = self.strt.find(&mut self.pool.strings, s, hash, cw) {
                self.strt.cache_put(s, id);
                return Ok(id);
            }
            let size = std::mem::size_of::<crate::gc::VelaStr>() + s.len();
            self.mem_charge(0, size)?;
            let id = self
                .strt
                .insert_short(&mut self.pool.strings, self.gc.current_white, s, hash);
            self.gc.link_allgc(GcId::Str(id));
            self.strt.cache_put(s, id);
            Ok(id)
        } else {
            self.check_gc();
            let str_obj = crate::gc::VelaStr::new_long(s);
            let size = str_obj.byte_size();
            self.mem_charge(0, size)?;
            let id = StrId(self.pool.strings.alloc(
                GcHeader::with_white(self.gc.current_white, size as u32),
                str_obj,
            ));
            self.gc.link_allgc(GcId::Str(id));
            Ok(id)
        }
    }

    pub fn new_string(&mut self, s: &str) -> VelaResult<VelaValue> {
        let short = s.len() <= self.strt.short_limit;
        let id = self.new_string_id(s)?;
        Ok(VelaValue::string(id, short))
    }

    pub fn get_str(&self, v: VelaValue) -> Option<&str> {
        let id = v.as_str_id()?;
        self.pool.strings.get(id.0).map(|s| s.data.as_str())
    }

    // ============ Tables ============

    pub fn new_table(&mut self) -> VelaResult<VelaValue> {
        self.check_gc();
        let t = VelaTable::new();
        let size = t.byte_size();
        self.mem_charge(0, size)?;
        let id = TableId(self.pool.tables.alloc(
            GcHeader::with_white(self.gc.current_white, size as u32),
            t,
        ));
        self.gc.link_allgc(GcId::Table(id));
        Ok(VelaValue::table(id))
    }

    fn table_id(&self, t: VelaValue) -> VelaResult<TableId> {
        t.as_table_id()
            .ok_or_else(|| VelaError::Runtime(format!("{} is not a table", t.type_name())))
    }

    pub fn table_get(&self, t: VelaValue, key: VelaValue) -> VelaResult<VelaValue> {
        let tid = self.table_id(t)?;
        let strs = Strings {
            pool: &self.pool.strings,
            hasher: self.strt.hasher(),
        };
        match self.pool.tables.get(tid.0) {
            Some(tb) => Ok(tb.data.get(&strs, &key)),
            None => Ok(VelaValue::nil()),
        }
    }

    pub fn table_get_int(&self, t: VelaValue, key: i64) -> VelaResult<VelaValue> {
        let tid = self.table_id(t)?;
        match self.pool.tables.get(tid.0) {
            Some(tb) => Ok(tb.data.get_int(key)),
            None => Ok(VelaValue::nil()),
        }
    }

    pub fn table_set(&mut self, t: VelaValue, key: VelaValue, value: VelaValue) -> VelaResult<()> {
        let tid = self.table_id(t)?;
        let (old_size, new_size) = {
            let ObjectPool {
                strings, tables, ..
            } = &mut self.pool;
            let strs = Strings {
                pool: strings,
                hasher: self.strt.hasher(),
            };
            let Some(tb) = tables.get_mut(tid.0) else {
                return runtime_error("stale table reference");
            };
            let old = tb.data.byte_size();
            tb.data.set(&strs, key, value)?;
            (old, tb.data.byte_size())
        };
        self.table_barrier(tid, &key, &value);
        if new_size != old_size {
            self.mem_charge(old_size, new_size)?;
            if let Some(tb) = self.pool.tables.get_mut(tid.0) {
                tb.header.size = new_size as u32;
            }
        }
        Ok(())
    }

    pub fn table_set_int(&mut self, t: VelaValue, key: i64, value: VelaValue) -> VelaResult<()> {
        self.table_set(t, VelaValue::integer(key), value)
    }

    /// A boundary of the table: `t[n]` non-nil, `t[n+1]` nil. With
    /// interior nils any boundary may be returned.
    pub fn table_len(&self, t: VelaValue) -> VelaResult<i64> {
        let tid = self.table_id(t)?;
        Ok(self
            .pool
            .tables
            .get(tid.0)
            .map(|tb| tb.data.len())
            .unwrap_or(0))
    }

    /// Traversal: nil starts it; returns the next visible entry, or
    /// None at the end. Errors on a key not present in the table.
    pub fn table_next(
        &self,
        t: VelaValue,
        key: VelaValue,
    ) -> VelaResult<Option<(VelaValue, VelaValue)>> {
        let tid = self.table_id(t)?;
        let strs = Strings {
            pool: &self.pool.strings,
            hasher: self.strt.hasher(),
        };
        match self.pool.tables.get(tid.0) {
            Some(tb) => tb.data.next(&strs, &key),
            None => Ok(None),
        }
    }

    /// Explicitly resize both table parts.
    pub fn table_resize(&mut self, t: VelaValue, nasize: usize, nhsize: usize) -> VelaResult<()> {
        let tid = self.table_id(t)?;
        let (old_size, new_size) = {
            let ObjectPool {
                strings, tables, ..
            } = &mut self.pool;
            let strs = Strings {
                pool: strings,
                hasher: self.strt.hasher(),
            };
            let Some(tb) = tables.get_mut(tid.0) else {
                return runtime_error("stale table reference");
            };
            let old = tb.data.byte_size();
            tb.data.resize(&strs, nasize, nhsize)?;
            (old, tb.data.byte_size())
        };
        if new_size != old_size {
            self.mem_charge(old_size, new_size)?;
            if let Some(tb) = self.pool.tables.get_mut(tid.0) {
                tb.header.size = new_size as u32;
            }
        }
        Ok(())
    }

    /// Resize only the array part, keeping the hash part as sized.
    pub fn table_resize_array(&mut self, t: VelaValue, nasize: usize) -> VelaResult<()> {
        let tid = self.table_id(t)?;
        let (old_size, new_size) = {
            let ObjectPool {
                strings, tables, ..
            } = &mut self.pool;
            let strs = Strings {
                pool: strings,
                hasher: self.strt.hasher(),
            };
            let Some(tb) = tables.get_mut(tid.0) else {
                return runtime_error("stale table reference");
            };
            let old = tb.data.byte_size();
            tb.data.resize_array(&strs, nasize)?;
            (old, tb.data.byte_size())
        };
        if new_size != old_size {
            self.mem_charge(old_size, new_size)?;
            if let Some(tb) = self.pool.tables.get_mut(tid.0) {
                tb.header.size = new_size as u32;
            }
        }
        Ok(())
    }

    /// Back barrier: a write put a fresh (white) key or value into a
    /// black table; revert the table to gray for an atomic revisit.
    fn table_barrier(&mut self, tid: TableId, key: &VelaValue, value: &VelaValue) {
        let black = self
            .pool
            .tables
            .get(tid.0)
            .map(|t| t.header.is_black())
            .unwrap_or(false);
        if !black {
            return;
        }
        if self.value_is_white(key) || self.value_is_white(value) {
            let VelaVM { gc, pool, .. } = self;
            gc.barrier_back(tid, pool);
        }
    }

    fn value_is_white(&self, v: &VelaValue) -> bool {
        v.gc_id()
            .and_then(|id| self.pool.header(id))
            .map(|h| h.is_white())
            .unwrap_or(false)
    }

    // ============ Metatables ============

    pub fn get_metatable(&self, obj: VelaValue) -> Option<VelaValue> {
        let mt = match obj.primary_type() {
            T_TABLE => self
                .pool
                .tables
                .get(obj.as_table_id()?.0)
                .and_then(|t| t.data.metatable),
            T_USERDATA if obj.tag() == V_USERDATA => self
                .pool
                .userdata
                .get(obj.as_userdata_id()?.0)
                .and_then(|u| u.data.metatable),
            pt if (pt as usize) < NUM_TYPES => self.basic_mt[pt as usize],
            _ => None,
        }?;
        Some(VelaValue::table(mt))
    }

    /// Install or clear a metatable. Attaching one with a `__gc` field
    /// also queues the object for finalization.
    pub fn set_metatable(&mut self, obj: VelaValue, mt: Option<VelaValue>) -> VelaResult<()> {
        let mt_id = match mt {
            Some(v) => Some(
                v.as_table_id()
                    .ok_or_else(|| VelaError::Runtime("metatable must be a table".into()))?,
            ),
            None => None,
        };
        match obj.tag() {
            V_TABLE => {
                let tid = self.table_id(obj)?;
                match self.pool.tables.get_mut(tid.0) {
                    Some(t) => t.data.metatable = mt_id,
                    None => return runtime_error("stale table reference"),
                }
                if let Some(mt_id) = mt_id {
                    let VelaVM { gc, pool, .. } = self;
                    gc.barrier_forward(GcId::Table(tid), GcId::Table(mt_id), pool);
                }
            }
            V_USERDATA => {
                let uid = obj
                    .as_userdata_id()
                    .ok_or_else(|| VelaError::Runtime("not a userdata".into()))?;
                match self.pool.userdata.get_mut(uid.0) {
                    Some(u) => u.data.metatable = mt_id,
                    None => return runtime_error("stale userdata reference"),
                }
                if let Some(mt_id) = mt_id {
                    let VelaVM { gc, pool, .. } = self;
                    gc.barrier_forward(GcId::Userdata(uid), GcId::Table(mt_id), pool);
                }
            }
            _ => {
                self.basic_mt[obj.primary_type() as usize] = mt_id;
            }
        }
        if mt_id.is_some() && obj.is_collectable() {
            self.register_finalizable(obj)?;
        }
        Ok(())
    }

    /// Metamethod lookup with the absent-cache fast path on the
    /// metatable's flags byte.
    pub fn get_metamethod(&mut self, obj: VelaValue, tm: TagMethod) -> Option<VelaValue> {
        let mt = self.get_metatable(obj)?.as_table_id()?;
        let tm_idx = tm as usize;
        if tm_idx < TM_CACHED {
            let absent = self
                .pool
                .tables
                .get(mt.0)
                .map(|t| t.data.flags & (1 << tm_idx) != 0)
                .unwrap_or(true);
            if absent {
                return None;
            }
        }
        let name = VelaValue::string(self.tm_names[tm_idx], true);
        let strs = Strings {
            pool: &self.pool.strings,
            hasher: self.strt.hasher(),
        };
        let v = self.pool.tables.get(mt.0)?.data.get(&strs, &name);
        if v.is_nil() {
            if tm_idx < TM_CACHED {
                if let Some(t) = self.pool.tables.get_mut(mt.0) {
                    t.data.flags |= 1 << tm_idx;
                }
            }
            None
        } else {
            Some(v)
        }
    }

    // ============ Closures ============

    pub fn new_native_closure(
        &mut self,
        f: NativeFn,
        upvals: Vec<VelaValue>,
    ) -> VelaResult<VelaValue> {
        self.check_gc();
        let size = std::mem::size_of::<VelaClosure>()
            + upvals.len() * std::mem::size_of::<VelaValue>();
        self.mem_charge(0, size)?;
        let id = self.pool.closures.alloc(
            GcHeader::with_white(self.gc.current_white, size as u32),
            VelaClosure::Native { f, upvals },
        );
        let cid = crate::gc::ClosureId(id);
        self.gc.link_allgc(GcId::Closure(cid));
        Ok(VelaValue::closure(cid, false))
    }

    /// A scripted closure starts with no upvalues; `init_upvals` fills
    /// the slots its prototype declares.
    pub fn new_script_closure(&mut self, proto: Rc<Proto>) -> VelaResult<VelaValue> {
        self.check_gc();
        let size = std::mem::size_of::<VelaClosure>()
            + proto.nupvals as usize * std::mem::size_of::<UpvalId>();
        self.mem_charge(0, size)?;
        let id = self.pool.closures.alloc(
            GcHeader::with_white(self.gc.current_white, size as u32),
            VelaClosure::Script {
                proto,
                upvals: Vec::new(),
            },
        );
        let cid = crate::gc::ClosureId(id);
        self.gc.link_allgc(GcId::Closure(cid));
        Ok(VelaValue::closure(cid, true))
    }

    /// Fill a scripted closure's upvalue slots with fresh closed-nil
    /// upvalues.
    pub fn init_upvals(&mut self, closure: VelaValue) -> VelaResult<()> {
        let cid = closure
            .as_closure_id()
            .ok_or_else(|| VelaError::Runtime("not a closure".into()))?;
        let n = match self.pool.closures.get(cid.0) {
            Some(c) => match &c.data {
                VelaClosure::Script { proto, upvals } => {
                    if !upvals.is_empty() {
                        return Ok(()); // already initialized
                    }
                    proto.nupvals as usize
                }
                VelaClosure::Native { .. } => return Ok(()),
            },
            None => return runtime_error("stale closure reference"),
        };
        // attach each upvalue as soon as it exists, so a collection
        // triggered by the next allocation sees it through the closure
        for _ in 0..n {
            let uid = self.alloc_upval(VelaUpvalue::new_closed(VelaValue::nil()))?;
            if let Some(u) = self.pool.upvals.get_mut(uid.0) {
                u.data.refcount = 1;
            }
            if let Some(c) = self.pool.closures.get_mut(cid.0) {
                if let VelaClosure::Script { upvals, .. } = &mut c.data {
                    upvals.push(uid);
                }
            }
        }
        Ok(())
    }

    fn alloc_upval(&mut self, uv: VelaUpvalue) -> VelaResult<UpvalId> {
        let size = std::mem::size_of::<VelaUpvalue>();
        self.mem_charge(0, size)?;
        let id = UpvalId(self.pool.upvals.alloc(
            GcHeader::with_white(self.gc.current_white, size as u32),
            uv,
        ));
        self.gc.link_allgc(GcId::Upval(id));
        Ok(id)
    }

    // ============ Userdata ============

    pub fn new_userdata(&mut self, data: Box<dyn std::any::Any>) -> VelaResult<VelaValue> {
        self.check_gc();
        let size = std::mem::size_of::<VelaUserdata>() + 64; // opaque payload estimate
        self.mem_charge(0, size)?;
        let id = self.pool.userdata.alloc(
            GcHeader::with_white(self.gc.current_white, size as u32),
            VelaUserdata::new(data),
        );
        let uid = crate::gc::UserdataId(id);
        self.gc.link_allgc(GcId::Userdata(uid));
        Ok(VelaValue::userdata(uid))
    }

    // ============ Threads ============

    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    pub fn new_thread(&mut self) -> VelaResult<VelaValue> {
        self.check_gc();
        let th = VelaState::new(self.options.initial_stack_size, self.options.max_stack_size);
        let size = th.byte_size();
        self.mem_charge(0, size)?;
        let id = ThreadId(self.pool.threads.alloc(
            GcHeader::with_white(self.gc.current_white, size as u32),
            th,
        ));
        self.gc.link_allgc(GcId::Thread(id));
        Ok(VelaValue::thread(id))
    }

    pub fn thread_status(&self, thread: ThreadId) -> ThreadStatus {
        self.pool
            .threads
            .get(thread.0)
            .map(|t| t.data.status)
            .unwrap_or(ThreadStatus::Dead)
    }

    pub fn push(&mut self, thread: ThreadId, v: VelaValue) -> VelaResult<()> {
        let (old_size, new_size, r) = {
            let Some(t) = self.pool.threads.get_mut(thread.0) else {
                return runtime_error("stale thread reference");
            };
            let old = t.data.byte_size();
            let r = t.data.push(v);
            (old, t.data.byte_size(), r)
        };
        r?;
        if new_size != old_size {
            self.mem_charge(old_size, new_size)?;
            if let Some(t) = self.pool.threads.get_mut(thread.0) {
                t.header.size = new_size as u32;
            }
        }
        Ok(())
    }

    pub fn pop(&mut self, thread: ThreadId) -> VelaValue {
        self.pool
            .threads
            .get_mut(thread.0)
            .map(|t| t.data.pop())
            .unwrap_or(VelaValue::nil())
    }

    pub fn stack_get(&self, thread: ThreadId, idx: i32) -> VelaValue {
        self.pool
            .threads
            .get(thread.0)
            .map(|t| t.data.get(idx))
            .unwrap_or(VelaValue::nil())
    }

    pub fn stack_set(&mut self, thread: ThreadId, idx: i32, v: VelaValue) -> VelaResult<()> {
        match self.pool.threads.get_mut(thread.0) {
            Some(t) => t.data.set(idx, v),
            None => runtime_error("stale thread reference"),
        }
    }

    pub fn thread_top(&self, thread: ThreadId) -> usize {
        self.pool
            .threads
            .get(thread.0)
            .map(|t| t.data.top())
            .unwrap_or(0)
    }

    /// Lower a thread's top, closing upvalues over the removed slots.
    pub fn set_thread_top(&mut self, thread: ThreadId, new_top: usize) -> VelaResult<()> {
        self.close_upvals(thread, new_top)?;
        match self.pool.threads.get_mut(thread.0) {
            Some(t) => {
                t.data.set_top(new_top);
                Ok(())
            }
            None => runtime_error("stale thread reference"),
        }
    }

    /// Mark a thread suspended at a yield point.
    pub fn suspend(&mut self, thread: ThreadId) -> VelaResult<()> {
        match self.pool.threads.get_mut(thread.0) {
            Some(t) => {
                t.data.status = ThreadStatus::Suspended;
                Ok(())
            }
            None => runtime_error("stale thread reference"),
        }
    }

    pub fn resume(&mut self, thread: ThreadId) -> VelaResult<()> {
        match self.pool.threads.get_mut(thread.0) {
            Some(t) => match t.data.status {
                ThreadStatus::Suspended | ThreadStatus::Ok => {
                    t.data.status = ThreadStatus::Ok;
                    Ok(())
                }
                _ => runtime_error("cannot resume dead thread"),
            },
            None => runtime_error("stale thread reference"),
        }
    }

    /// Cancel a coroutine: unwind its frames, closing upvalues at each
    /// scripted frame, then mark it dead.
    pub fn cancel_thread(&mut self, thread: ThreadId) -> VelaResult<()> {
        loop {
            let frame = match self.pool.threads.get_mut(thread.0) {
                Some(t) => t.data.pop_frame(),
                None => return runtime_error("stale thread reference"),
            };
            match frame {
                Some(ci) => self.close_upvals(thread, ci.func)?,
                None => break,
            }
        }
        self.close_upvals(thread, 0)?;
        if let Some(t) = self.pool.threads.get_mut(thread.0) {
            t.data.set_top(0);
            t.data.status = ThreadStatus::Dead;
        }
        Ok(())
    }

    // ============ Calls ============

    /// Call a native function with `nargs` arguments on top of the
    /// thread's stack. No protection: errors propagate to the caller.
    pub fn call_native(
        &mut self,
        thread: ThreadId,
        f: NativeFn,
        nargs: usize,
    ) -> VelaResult<usize> {
        self.call_native_with_status(thread, f, nargs, 0)
    }

    fn call_native_with_status(
        &mut self,
        thread: ThreadId,
        f: NativeFn,
        nargs: usize,
        status: u32,
    ) -> VelaResult<usize> {
        {
            let Some(t) = self.pool.threads.get_mut(thread.0) else {
                return runtime_error("stale thread reference");
            };
            let top = t.data.top();
            let func = top.saturating_sub(nargs);
            let mut ci = CallInfo::new_native(func, top, -1);
            ci.status |= status;
            t.data.push_frame(ci);
        }
        let r = f(self, thread);
        if let Some(t) = self.pool.threads.get_mut(thread.0) {
            t.data.pop_frame();
        }
        if r.is_err() && self.protect_depth == 0 {
            if let (Some(p), Err(e)) = (self.panic, &r) {
                p(e);
            }
        }
        r
    }

    /// Protected call: on error the thread is unwound back to its
    /// state at entry, upvalues over the abandoned slots are closed,
    /// and the error is returned as a value.
    pub fn protected_call(
        &mut self,
        thread: ThreadId,
        f: NativeFn,
        nargs: usize,
    ) -> VelaResult<usize> {
        let (saved_top, saved_depth) = match self.pool.threads.get(thread.0) {
            Some(t) => (t.data.top(), t.data.call_depth()),
            None => return runtime_error("stale thread reference"),
        };
        let entry_level = saved_top.saturating_sub(nargs);
        self.protect_depth += 1;
        let r = self.call_native(thread, f, nargs);
        self.protect_depth -= 1;
        if r.is_err() {
            // release resources held by the abandoned frames
            let _ = self.close_upvals(thread, entry_level);
            if let Some(t) = self.pool.threads.get_mut(thread.0) {
                while t.data.call_depth() > saved_depth {
                    t.data.pop_frame();
                }
                t.data.set_top(entry_level);
                t.data.status = ThreadStatus::Ok;
            }
        }
        r
    }

    pub fn set_panic(&mut self, f: Option<PanicFn>) -> Option<PanicFn> {
        std::mem::replace(&mut self.panic, f)
    }

    // ============ Upvalues ============

    /// Find or create the open upvalue for a stack slot. The open list
    /// is kept sorted by descending level; unreferenced, untouched
    /// upvalues met on the way are unlinked for reclaim.
    pub fn find_upval(&mut self, thread: ThreadId, level: usize) -> VelaResult<UpvalId> {
        let mut insert_at: Option<usize> = None;
        let mut found: Option<UpvalId> = None;
        {
            let ObjectPool {
                threads, upvals, ..
            } = &mut self.pool;
            let Some(t) = threads.get_mut(thread.0) else {
                return runtime_error("stale thread reference");
            };
            let mut i = 0;
            while i < t.data.open_upvals.len() {
                let uid = t.data.open_upvals[i];
                let Some(u) = upvals.get_mut(uid.0) else {
                    t.data.open_upvals.remove(i);
                    continue;
                };
                let Some(l) = u.data.level() else {
                    t.data.open_upvals.remove(i);
                    continue;
                };
                if l == level {
                    u.data.refcount += 1;
                    u.data.touch();
                    found = Some(uid);
                    break;
                }
                if l < level {
                    insert_at = Some(i);
                    break;
                }
                if u.data.refcount == 0 && !u.data.touched() {
                    // dead weight: unlink it; the collector frees it
                    t.data.open_upvals.remove(i);
                    continue;
                }
                i += 1;
            }
            if found.is_none() && insert_at.is_none() {
                insert_at = Some(t.data.open_upvals.len());
            }
        }
        if let Some(uid) = found {
            return Ok(uid);
        }
        let mut uv = VelaUpvalue::new_open(thread, level);
        uv.refcount = 1;
        let uid = self.alloc_upval(uv)?;
        let pos = insert_at.unwrap_or(0);
        if let Some(t) = self.pool.threads.get_mut(thread.0) {
            t.data.open_upvals.insert(pos, uid);
        }
        if !self.gc.twups.contains(&thread) {
            self.gc.twups.push(thread);
        }
        Ok(uid)
    }

    /// Close every open upvalue at or above `level`: detach it from the
    /// open list and move the stack value inline.
    pub fn close_upvals(&mut self, thread: ThreadId, level: usize) -> VelaResult<()> {
        let to_close: Vec<UpvalId> = {
            let Some(t) = self.pool.threads.get_mut(thread.0) else {
                return runtime_error("stale thread reference");
            };
            let mut count = 0;
            for &uid in &t.data.open_upvals {
                let l = self
                    .pool
                    .upvals
                    .get(uid.0)
                    .and_then(|u| u.data.level())
                    .unwrap_or(0);
                if l >= level {
                    count += 1;
                } else {
                    break; // list is sorted descending
                }
            }
            t.data.open_upvals.drain(0..count).collect()
        };
        for uid in to_close {
            let value = {
                let level = self
                    .pool
                    .upvals
                    .get(uid.0)
                    .and_then(|u| u.data.level())
                    .unwrap_or(0);
                self.pool
                    .threads
                    .get(thread.0)
                    .and_then(|t| t.data.stack.get(level).copied())
                    .unwrap_or(VelaValue::nil())
            };
            if let Some(u) = self.pool.upvals.get_mut(uid.0) {
                u.data.close(value);
            }
            let VelaVM { gc, pool, .. } = self;
            gc.barrier_upval_close(&value, pool);
        }
        Ok(())
    }

    /// Capture a stack slot into a scripted closure's upvalue slot.
    pub fn capture_upval(
        &mut self,
        closure: VelaValue,
        slot: usize,
        thread: ThreadId,
        level: usize,
    ) -> VelaResult<UpvalId> {
        let cid = closure
            .as_closure_id()
            .ok_or_else(|| VelaError::Runtime("not a closure".into()))?;
        let uid = self.find_upval(thread, level)?;
        let prev = {
            let Some(c) = self.pool.closures.get_mut(cid.0) else {
                return runtime_error("stale closure reference");
            };
            match &mut c.data {
                VelaClosure::Script { upvals, .. } => {
                    if slot >= upvals.len() {
                        return runtime_error("upvalue slot out of range");
                    }
                    std::mem::replace(&mut upvals[slot], uid)
                }
                VelaClosure::Native { .. } => {
                    return runtime_error("native closures capture by value");
                }
            }
        };
        if prev != uid {
            if let Some(u) = self.pool.upvals.get_mut(prev.0) {
                u.data.refcount = u.data.refcount.saturating_sub(1);
            }
        }
        let VelaVM { gc, pool, .. } = self;
        gc.barrier_forward(GcId::Closure(cid), GcId::Upval(uid), pool);
        Ok(uid)
    }

    /// Read through an upvalue, wherever its value lives.
    pub fn upval_get(&self, uid: UpvalId) -> VelaValue {
        match self.pool.upvals.get(uid.0) {
            Some(u) => match &u.data.state {
                UpvalState::Closed(v) => *v,
                UpvalState::Open { thread, level, .. } => self
                    .pool
                    .threads
                    .get(thread.0)
                    .and_then(|t| t.data.stack.get(*level).copied())
                    .unwrap_or(VelaValue::nil()),
            },
            None => VelaValue::nil(),
        }
    }

    /// Write through an upvalue.
    pub fn upval_set(&mut self, uid: UpvalId, v: VelaValue) -> VelaResult<()> {
        let open_slot = match self.pool.upvals.get_mut(uid.0) {
            Some(u) => match &mut u.data.state {
                UpvalState::Closed(slot) => {
                    *slot = v;
                    None
                }
                UpvalState::Open { thread, level, .. } => Some((*thread, *level)),
            },
            None => return runtime_error("stale upvalue reference"),
        };
        if let Some((thread, level)) = open_slot {
            if let Some(t) = self.pool.threads.get_mut(thread.0) {
                if level < t.data.stack.len() {
                    t.data.stack[level] = v;
                }
            }
        } else if let Some(vid) = v.gc_id() {
            let VelaVM { gc, pool, .. } = self;
            gc.barrier_forward(GcId::Upval(uid), vid, pool);
        }
        Ok(())
    }

    pub fn upval_refcount(&self, uid: UpvalId) -> u32 {
        self.pool
            .upvals
            .get(uid.0)
            .map(|u| u.data.refcount)
            .unwrap_or(0)
    }

    pub fn upval_is_open(&self, uid: UpvalId) -> bool {
        self.pool
            .upvals
            .get(uid.0)
            .map(|u| u.data.is_open())
            .unwrap_or(false)
    }

    // ============ Values ============

    pub fn registry(&self) -> VelaValue {
        self.registry
    }

    pub fn globals(&self) -> VelaResult<VelaValue> {
        self.table_get_int(self.registry, 2)
    }

    /// Raw equality, the way table keys compare.
    pub fn raw_equals(&self, a: VelaValue, b: VelaValue) -> bool {
        let strs = Strings {
            pool: &self.pool.strings,
            hasher: self.strt.hasher(),
        };
        crate::value::table::raw_eq(&a, &b, &strs)
    }

    /// Human-readable rendering for diagnostics.
    pub fn display_value(&self, v: VelaValue) -> String {
        match v.tag() {
            V_NIL => "nil".into(),
            V_TRUE => "true".into(),
            V_FALSE => "false".into(),
            V_INT => {
                let mut buf = itoa::Buffer::new();
                buf.format(v.as_integer().unwrap_or(0)).to_string()
            }
            V_FLOAT => format!("{:?}", v.as_float().unwrap_or(0.0)),
            V_SHRSTR | V_LNGSTR => self.get_str(v).unwrap_or("<stale string>").to_string(),
            V_TABLE => format!("table: {:#x}", v.raw_bits()),
            V_NATIVECL | V_SCRIPTCL => format!("function: {:#x}", v.raw_bits()),
            _ => format!("{}: {:#x}", v.type_name(), v.raw_bits()),
        }
    }
}
