//! Niebla - a dense id mint and component store for per-resource metadata.
//!
//! This library hands out Persistent Unique IDs (PUIDs) for long-lived GPU
//! resources and stores per-resource metadata in component tables indexed
//! by those ids. The PUID is the join key between CPU bookkeeping and the
//! GPU-resident tables shaders read, so the allocation rules are strict:
//! ids are dense, allocation is monotonic, and a freed id is never reused
//! for the remainder of the session. A recycled id would let a stale GPU
//! table entry alias a new resource.
//!
//! Ids are capped at 26 bits, matching the field width shaders pack them
//! into. Minting past the ceiling is a hard error.
//!
//! Metadata lives in `Component` tables. The default table is sparse and
//! allocates in blocks, since most tables only cover a fraction of the
//! resources in flight. `NonSparseComponent` keeps one contiguous backing
//! array instead and exposes it as a raw slice, which is how the
//! PUID-to-block map gets handed to the GPU upload path without a copy.
//!
//! A `Puid` is internally an `Arc`; when the last clone drops, every
//! component value stored for it is dropped as well. The id itself stays
//! burned.
//!
//! # Basic Usage
//!
//! ```
//! use niebla as nb;
//! let mut session = nb::Session::new();
//! let id = session.mint().unwrap();
//!
//! let mut meta = session.add_component();
//! meta.set(&id, "storage buffer");
//! assert_eq!(*meta.get(&id).unwrap(), "storage buffer");
//! ```
// Austin Shafer - 2025

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[cfg(test)]
mod tests;

/// The largest id we will ever mint. PUIDs are packed into 26-bit
/// fields in GPU-visible tables and message payloads.
pub const PUID_BIT_WIDTH: u32 = 26;
pub const PUID_CEILING: usize = (1 << PUID_BIT_WIDTH) - 1;

/// The storage backend for a particular table
///
/// This trait allows uniform access to the sparse and contiguous
/// storage types.
pub trait Container<T: 'static> {
    fn index(&self, index: usize) -> Option<&T>;
    fn index_mut(&mut self, index: usize) -> Option<&mut T>;
    fn set(&mut self, index: usize, val: T);
    fn take(&mut self, index: usize) -> Option<T>;
    fn get_next_id(&self, index: usize) -> Option<usize>;
}

/// Arbitrarily chosen size of the blocks in the sparse allocator.
const DEFAULT_BLOCK_SIZE: usize = 32;

/// Our basic sparse storage
///
/// Presented as one congruent array but really a series of blocks
/// allocated as their indices get touched. Tables that only cover a
/// handful of the resources in a session stay small.
pub struct BlockContainer<T: 'static> {
    b_block_size: usize,
    b_blocks: Vec<Option<Vec<Option<T>>>>,
}

impl<T: 'static> BlockContainer<T> {
    fn new(block_size: usize) -> Self {
        Self {
            b_block_size: block_size,
            b_blocks: Vec::new(),
        }
    }

    /// Helper that turns a global index into a block + offset index pair
    fn get_indices(&self, index: usize) -> (usize, usize) {
        (index / self.b_block_size, index % self.b_block_size)
    }

    /// Ensure that we have a block allocated for this index. Dynamic
    /// allocation is done here.
    fn ensure_space_for_id(&mut self, index: usize) {
        let (bi, i) = self.get_indices(index);

        if bi >= self.b_blocks.len() {
            self.b_blocks.resize_with(bi + 1, || None);
        }

        if self.b_blocks[bi].is_none() {
            let mut new_vec = Vec::new();
            new_vec.resize_with(self.b_block_size, || None);

            assert!(i < new_vec.len());
            self.b_blocks[bi] = Some(new_vec);
        }
    }
}

impl<T: 'static> Container<T> for BlockContainer<T> {
    fn index(&self, index: usize) -> Option<&T> {
        let (bi, i) = self.get_indices(index);
        if bi >= self.b_blocks.len() || self.b_blocks[bi].is_none() {
            return None;
        }
        self.b_blocks[bi].as_ref().unwrap()[i].as_ref()
    }
    fn index_mut(&mut self, index: usize) -> Option<&mut T> {
        self.ensure_space_for_id(index);

        let (bi, i) = self.get_indices(index);
        assert!(bi < self.b_blocks.len());
        self.b_blocks[bi].as_mut().unwrap()[i].as_mut()
    }
    fn set(&mut self, index: usize, val: T) {
        self.ensure_space_for_id(index);

        let (bi, i) = self.get_indices(index);
        assert!(bi < self.b_blocks.len());
        self.b_blocks[bi].as_mut().unwrap()[i] = Some(val);
    }
    fn take(&mut self, index: usize) -> Option<T> {
        let (bi, i) = self.get_indices(index);
        if bi >= self.b_blocks.len() || self.b_blocks[bi].is_none() {
            return None;
        }
        self.b_blocks[bi].as_mut().unwrap()[i].take()
    }
    fn get_next_id(&self, index: usize) -> Option<usize> {
        let (bi, block_offset) = self.get_indices(index);
        if bi >= self.b_blocks.len() {
            return None;
        }

        let mut offset = Some(block_offset + 1);
        // Test all remaining blocks, starting with the current one
        for block_index in bi..self.b_blocks.len() {
            if let Some(block) = self.b_blocks[block_index].as_ref() {
                let start_index = match offset.take() {
                    Some(off) => off,
                    None => 0,
                };
                for i in start_index..block.len() {
                    if block[i].is_some() {
                        return Some(block_index * self.b_block_size + i);
                    }
                }
            }
        }

        None
    }
}

/// A contiguous container
///
/// The internal storage is a plain `Vec<T>` so all values can be
/// viewed as one slice, which is what the GPU upload path wants. The
/// cost is a default value for every untouched cell.
pub struct SliceContainer<T: 'static> {
    s_callback: Box<dyn Fn() -> T>,
    s_vec: Vec<T>,
}

impl<T: 'static> SliceContainer<T> {
    fn ensure_space_for_id(&mut self, index: usize) {
        if index >= self.s_vec.len() {
            self.s_vec.resize_with(index + 1, &*self.s_callback);
        }
    }

    fn as_slice<'a>(&'a self) -> &'a [T] {
        self.s_vec.as_slice()
    }
}

impl<T: 'static> Container<T> for SliceContainer<T> {
    fn index(&self, index: usize) -> Option<&T> {
        if index >= self.s_vec.len() {
            return None;
        }
        Some(&self.s_vec[index])
    }
    fn index_mut(&mut self, index: usize) -> Option<&mut T> {
        self.ensure_space_for_id(index);
        Some(&mut self.s_vec[index])
    }
    fn set(&mut self, index: usize, val: T) {
        self.ensure_space_for_id(index);
        self.s_vec[index] = val;
    }
    /// The slice container doesn't distinguish "set" from "unset",
    /// it's just a defined value vs the default from the callback.
    fn take(&mut self, index: usize) -> Option<T> {
        self.ensure_space_for_id(index);
        let mut tmp = (self.s_callback)();
        std::mem::swap(&mut self.s_vec[index], &mut tmp);
        Some(tmp)
    }
    fn get_next_id(&self, index: usize) -> Option<usize> {
        if index + 1 >= self.s_vec.len() {
            return None;
        }

        Some(index + 1)
    }
}

pub struct PuidInternal {
    p_session: Session,
    p_id: usize,
}

impl fmt::Debug for PuidInternal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Puid").field("p_id", &self.p_id).finish()
    }
}

impl PuidInternal {
    /// Gets the raw index for this id, used when packing it into GPU
    /// tables and message payloads.
    pub fn get_raw_id(&self) -> usize {
        self.p_id
    }
}

impl Drop for PuidInternal {
    fn drop(&mut self) {
        self.p_session.retire_id(self.p_id);
    }
}

impl PartialEq for PuidInternal {
    fn eq(&self, other: &Self) -> bool {
        self.p_id == other.p_id && self.p_session == other.p_session
    }
}

/// A Persistent Unique ID
///
/// This is a refcounted handle to one resource id. Component values
/// stored for the id are dropped when the last clone of the handle
/// drops. The raw id is never handed out again.
pub type Puid = Arc<PuidInternal>;

/// A component table wrapper trait
///
/// This lets the Session clear a retired id out of every table
/// without knowing the tables' value types.
trait ComponentTable {
    /// Drop the value stored for this id, if any
    fn clear_id(&self, id: usize);

    fn as_any(&self) -> &dyn Any;
}

/// A table containing a series of optional values, indexed by raw PUID.
pub struct TableInternal<T: 'static, C: Container<T> + 'static> {
    t_store: C,
    _t_phantom: PhantomData<T>,
}

pub struct Table<T: 'static, C: Container<T> + 'static> {
    t_internal: Arc<RwLock<TableInternal<T, C>>>,
}

unsafe impl<T: Send + Sync + 'static, C: Container<T> + 'static> Send for Table<T, C> {}
unsafe impl<T: Send + Sync + 'static, C: Container<T> + 'static> Sync for Table<T, C> {}

impl<T: 'static, C: Container<T> + 'static> Clone for Table<T, C> {
    fn clone(&self) -> Self {
        Self {
            t_internal: self.t_internal.clone(),
        }
    }
}

impl<T: 'static, C: Container<T> + 'static> ComponentTable for Table<T, C> {
    fn clear_id(&self, id: usize) {
        let _val = {
            // Take the data but don't drop it until the write lock is
            // released, dropping it may re-enter this table
            self.t_internal.write().unwrap().t_store.take(id)
        };
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Read guard for one component value
pub struct TableRef<'a, T: 'static, C: Container<T> + 'static> {
    tr_guard: RwLockReadGuard<'a, TableInternal<T, C>>,
    tr_id: usize,
}

impl<'a, T: 'static, C: Container<T> + 'static> Deref for TableRef<'a, T, C> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.tr_guard.t_store.index(self.tr_id).unwrap()
    }
}

/// Write guard for one component value
pub struct TableRefMut<'a, T: 'static, C: Container<T> + 'static> {
    tr_guard: RwLockWriteGuard<'a, TableInternal<T, C>>,
    tr_id: usize,
}

impl<'a, T: 'static, C: Container<T> + 'static> Deref for TableRefMut<'a, T, C> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.tr_guard.t_store.index(self.tr_id).unwrap()
    }
}
impl<'a, T: 'static, C: Container<T> + 'static> DerefMut for TableRefMut<'a, T, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.tr_guard.t_store.index_mut(self.tr_id).unwrap()
    }
}

struct SessionInternal {
    /// The next id to mint. This only ever counts up.
    s_next_id: usize,
    /// How many minted ids are still live
    s_live_ids: usize,
}

struct ComponentList {
    cl_components: Vec<Box<dyn ComponentTable + Send + Sync>>,
}

/// One device session's worth of ids and metadata tables.
///
/// Id tracking and the component set have separate interior mutability
/// so that retiring an id (which walks every table) never holds the id
/// lock while table values drop.
#[derive(Clone)]
pub struct Session {
    s_internal: Arc<RwLock<SessionInternal>>,
    s_component_set: Arc<RwLock<ComponentList>>,
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.s_internal, &other.s_internal)
            && Arc::ptr_eq(&self.s_component_set, &other.s_component_set)
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            s_internal: Arc::new(RwLock::new(SessionInternal {
                s_next_id: 0,
                s_live_ids: 0,
            })),
            s_component_set: Arc::new(RwLock::new(ComponentList {
                cl_components: Vec::new(),
            })),
        }
    }

    /// The number of ids minted over the session lifetime, live or not.
    /// This is also the length the GPU-side PUID map has to cover.
    pub fn minted_count(&self) -> usize {
        self.s_internal.read().unwrap().s_next_id
    }

    /// The number of ids still live
    pub fn live_count(&self) -> usize {
        self.s_internal.read().unwrap().s_live_ids
    }

    /// Mint a new id
    ///
    /// Allocation is monotonic, retired ids are never handed out again.
    /// Returns None once the 26-bit ceiling is hit, at which point the
    /// caller has to stop tracking new resources for this session.
    pub fn mint(&mut self) -> Option<Puid> {
        let new_self = self.clone();
        let mut internal = self.s_internal.write().unwrap();

        if internal.s_next_id > PUID_CEILING {
            return None;
        }

        let id = internal.s_next_id;
        internal.s_next_id += 1;
        internal.s_live_ids += 1;

        return Some(Arc::new(PuidInternal {
            p_id: id,
            p_session: new_self,
        }));
    }

    /// Allocate a new sparse component table
    pub fn add_component<T: Send + Sync + 'static>(&mut self) -> Component<T> {
        self.add_raw_component(BlockContainer::new(DEFAULT_BLOCK_SIZE))
    }

    /// Allocate a new component table with contiguous storage
    ///
    /// The callback provides the default value filling untouched cells.
    /// Use this when the backing array gets handed to the GPU as a
    /// slice, such as the PUID-to-block map.
    pub fn add_non_sparse_component<T: Send + Sync + 'static, F>(
        &mut self,
        callback: F,
    ) -> NonSparseComponent<T>
    where
        F: Fn() -> T + 'static,
    {
        self.add_raw_component(SliceContainer {
            s_vec: Vec::new(),
            s_callback: Box::new(callback),
        })
    }

    fn add_raw_component<T: Send + Sync + 'static, C: Container<T> + 'static>(
        &mut self,
        container: C,
    ) -> RawComponent<T, C> {
        let mut cl = self.s_component_set.write().unwrap();

        let component_id = cl.cl_components.len();
        let new_table = Table {
            t_internal: Arc::new(RwLock::new(TableInternal {
                t_store: container,
                _t_phantom: PhantomData,
            })),
        };
        cl.cl_components.push(Box::new(new_table));

        let table = cl.cl_components[component_id]
            .as_any()
            .downcast_ref::<Table<T, C>>()
            .unwrap();

        return RawComponent {
            c_session: self.clone(),
            _c_phantom: PhantomData,
            c_table: table.clone(),
        };
    }

    /// Drop every component value for a retired id
    ///
    /// The id number itself stays burned, only the data goes away.
    fn retire_id(&mut self, id: usize) {
        {
            let cl = self.s_component_set.read().unwrap();
            for table in cl.cl_components.iter() {
                table.clear_id(id);
            }
        }

        self.s_internal.write().unwrap().s_live_ids -= 1;
    }
}

/// A Component holding values for each Puid
///
/// Each Component is a key-value store over the session's ids. Values
/// of type `T` are fetched with the `Puid` handle.
pub struct RawComponent<T: 'static, C: Container<T> + 'static> {
    c_session: Session,
    _c_phantom: PhantomData<T>,
    c_table: Table<T, C>,
}

/// General purpose sparse component, the default table type.
pub type Component<T> = RawComponent<T, BlockContainer<T>>;

/// Component with contiguous storage exposing a raw slice.
pub type NonSparseComponent<T> = RawComponent<T, SliceContainer<T>>;

impl<T: 'static, C: Container<T> + 'static> fmt::Debug for RawComponent<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component").finish()
    }
}

impl<T: 'static, C: Container<T> + 'static> Clone for RawComponent<T, C> {
    fn clone(&self) -> Self {
        Self {
            c_session: self.c_session.clone(),
            _c_phantom: PhantomData,
            c_table: self.c_table.clone(),
        }
    }
}

impl<T: 'static, C: Container<T> + 'static> RawComponent<T, C> {
    /// Get a reference to the value for this id
    ///
    /// The ref holds the table's read lock open for as long as it is
    /// alive, so don't retire ids or fetch mutably while holding one.
    #[inline]
    pub fn get(&self, id: &Puid) -> Option<TableRef<T, C>> {
        let table_internal = self.c_table.t_internal.read().unwrap();
        if table_internal.t_store.index(id.p_id).is_none() {
            return None;
        }

        return Some(TableRef {
            tr_guard: table_internal,
            tr_id: id.p_id,
        });
    }

    /// Get a mutable reference to the value for this id
    #[inline]
    pub fn get_mut(&self, id: &Puid) -> Option<TableRefMut<T, C>> {
        let table_internal = self.c_table.t_internal.write().unwrap();
        if table_internal.t_store.index(id.p_id).is_none() {
            return None;
        }

        return Some(TableRefMut {
            tr_guard: table_internal,
            tr_id: id.p_id,
        });
    }

    /// Set the value for this id
    #[inline]
    pub fn set(&self, id: &Puid, val: T) {
        // Clear the existing value first, outside the write lock.
        // Dropping it under the lock could re-enter this table.
        self.take(id);

        let mut table_internal = self.c_table.t_internal.write().unwrap();
        table_internal.t_store.set(id.p_id, val);
    }

    /// Unset the value for this id, returning what was stored
    pub fn take(&self, id: &Puid) -> Option<T> {
        let mut table_internal = self.c_table.t_internal.write().unwrap();
        table_internal.t_store.take(id.p_id)
    }

    /// Walk every populated (raw id, value) pair
    ///
    /// The callback runs under the table read lock.
    pub fn for_each<F: FnMut(usize, &T)>(&self, mut func: F) {
        let table_internal = self.c_table.t_internal.read().unwrap();

        let mut index = match table_internal.t_store.index(0) {
            Some(_) => Some(0),
            None => table_internal.t_store.get_next_id(0),
        };
        while let Some(i) = index {
            if let Some(val) = table_internal.t_store.index(i) {
                func(i, val);
            }
            index = table_internal.t_store.get_next_id(i);
        }
    }
}

impl<T: Clone + 'static, C: Container<T> + 'static> RawComponent<T, C> {
    /// Get a copy of the value for this id
    ///
    /// Saves the boilerplate Option handling when fetching refcounted
    /// values.
    pub fn get_clone(&self, id: &Puid) -> Option<T> {
        match self.get(id) {
            Some(v) => Some(v.clone()),
            None => None,
        }
    }
}

/// RwLock guard around the contiguous backing slice
pub struct SliceRef<'a, T: 'static> {
    sr_guard: RwLockReadGuard<'a, TableInternal<T, SliceContainer<T>>>,
}

impl<'a, T: 'static> SliceRef<'a, T> {
    pub fn data(&'a self) -> &'a [T] {
        self.sr_guard.t_store.as_slice()
    }
}

impl<T: 'static> RawComponent<T, SliceContainer<T>> {
    /// Get the backing slice where all data is stored
    ///
    /// This is how the contiguous tables get passed to the GPU upload
    /// path without copying.
    pub fn get_data_slice<'a>(&'a self) -> SliceRef<'a, T> {
        SliceRef {
            sr_guard: self.c_table.t_internal.read().unwrap(),
        }
    }

    /// Make sure the backing slice covers ids up to `count`
    pub fn ensure_len(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut table_internal = self.c_table.t_internal.write().unwrap();
        table_internal.t_store.ensure_space_for_id(count - 1);
    }
}
