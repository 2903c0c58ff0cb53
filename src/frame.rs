//! Frame-pipelined resource arena.
//!
//! [`FrameCache`] owns a fixed ring of N [`FrameInstance`]s, one per
//! frame in flight. Each rendering frame picks the next instance and
//! drives it through the phase cycle:
//!
//! ```text
//! begin_frame -> reserve_* (any threads) -> commit
//!             -> alloc_* (any threads)   -> freeze
//! ```
//!
//! Producers first *declare* total demand (reserve), the instance then
//! sizes its backing storage once (commit), and only afterwards are
//! concrete handles and byte ranges handed out (alloc). Backing
//! objects grow monotonically to the high-water mark of demand, so a
//! warmed-up arena commits frame after frame without a single backend
//! allocation call.
//!
//! Nothing here waits on the GPU. The ring gives instance *i*'s
//! resources N-1 frames of grace before its next `begin_frame`
//! reclaims them; fences making that window sufficient are the
//! caller's submission discipline.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::allocator::{
    align_up, ArenaBuffer, ArenaImage, ArenaImageView, ArenaMemory, BufferSlice, DeviceAllocator,
};
use crate::backend::{
    BufferUsage, DeviceBackend, ImageDescription, ImageHandle, ImageRange, ImageUsage,
    ImageViewHandle,
};
use crate::cache::{Key, KeyedCache, SharedCache};
use crate::descriptor::{DescriptorLayout, DescriptorPool, DescriptorSet};
use crate::error::{ArenaError, ErrorSink, FatalHook};
use crate::spinlock::SpinLock;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Phase of a frame instance's cycle.
///
/// Cyclic order: `Initial -> Reserving -> Committing -> Allocating ->
/// Frozen -> (cleanup) -> Initial`. Calling a phase method outside its
/// legal state is a fatal usage error, never a silent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FrameState {
    /// Idle; only `begin_frame` is legal.
    #[default]
    Initial = 0,
    /// Accepting `reserve_*` calls from any producer thread.
    Reserving = 1,
    /// Inside `commit`; the maps are detached from the lock.
    Committing = 2,
    /// Committed; accepting `alloc_*` calls from any producer thread.
    Allocating = 3,
    /// Frame recorded; resources stay untouched until the next
    /// `begin_frame` on this instance.
    Frozen = 4,
}

// ---------------------------------------------------------------------------
// Resource classes
// ---------------------------------------------------------------------------

/// Memory classes are keyed by backend memory type plus host
/// visibility, so host scratch never shares a block with device-local
/// images of a coincidentally equal type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MemKey {
    memory_type: u32,
    host_visible: bool,
}

#[derive(Default)]
struct MemoryClass {
    backing: Option<ArenaMemory>,
    needed_size: u64,
    used_size: u64,
    must_grow: bool,
}

struct SliceClass {
    backing: Option<ArenaBuffer>,
    needed_size: u64,
    used_size: u64,
    alignment: u64,
    memory_type: u32,
}

struct DescriptorClass {
    pool: Option<DescriptorPool>,
    layout: Arc<DescriptorLayout>,
    needed: u32,
    used: u32,
    sets: Vec<DescriptorSet>,
}

struct ImageClass {
    image: Option<ArenaImage>,
    usage: ImageUsage,
    desc: ImageDescription,
    needed_size: u64,
    ranges: Vec<ImageRange>,
    views: Vec<ArenaImageView>,
}

type ScratchValue = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct InstanceInner {
    state: FrameState,
    memories: FxHashMap<MemKey, MemoryClass>,
    slices: FxHashMap<BufferUsage, SliceClass>,
    descriptors: FxHashMap<Key, DescriptorClass>,
    images: FxHashMap<Key, ImageClass>,
    scratch: KeyedCache<ScratchValue>,
}

/// Maps detached from the instance lock for the duration of a commit,
/// so no backend call happens while the spinlock is held.
struct CommitMaps {
    memories: FxHashMap<MemKey, MemoryClass>,
    slices: FxHashMap<BufferUsage, SliceClass>,
    descriptors: FxHashMap<Key, DescriptorClass>,
    images: FxHashMap<Key, ImageClass>,
}

/// Backing objects replaced during a commit. Dropped only after every
/// rebind succeeded, so growth never destroys an object before its
/// replacement is in place.
#[derive(Default)]
struct Retired {
    pools: Vec<DescriptorPool>,
    views: Vec<ArenaImageView>,
    images: Vec<ArenaImage>,
    buffers: Vec<ArenaBuffer>,
    memories: Vec<ArenaMemory>,
}

struct Shared {
    cache: SharedCache,
    allocator: DeviceAllocator,
    sink: Arc<ErrorSink>,
}

// ---------------------------------------------------------------------------
// FrameInstance
// ---------------------------------------------------------------------------

/// One slot of the frame ring.
///
/// Within one frame, any number of producer threads may call
/// `reserve_*` concurrently, and later `alloc_*` concurrently; the
/// per-instance spinlock serializes the tiny map operations. The phase
/// transitions (`begin_frame`, `commit`, `freeze`) belong to the
/// frame's single orchestrating thread.
pub struct FrameInstance {
    index: usize,
    total: usize,
    core: Arc<Shared>,
    inner: SpinLock<InstanceInner>,
}

impl FrameInstance {
    fn new(index: usize, total: usize, core: Arc<Shared>) -> Self {
        Self {
            index,
            total,
            core,
            inner: SpinLock::new(InstanceInner::default()),
        }
    }

    /// This instance's ring index and the ring size.
    #[must_use]
    pub fn index(&self) -> (usize, usize) {
        (self.index, self.total)
    }

    /// Current phase (diagnostic; racy by nature).
    #[must_use]
    pub fn state(&self) -> FrameState {
        self.inner.lock().state
    }

    fn require_state(&self, inner: &InstanceInner, expected: FrameState) -> Result<(), ArenaError> {
        if inner.state == expected {
            Ok(())
        } else {
            Err(self.core.sink.fatal(ArenaError::InvalidState {
                instance: self.index,
                expected,
                actual: inner.state,
            }))
        }
    }

    /// Open the instance for a new frame.
    ///
    /// From `Frozen`, first reclaims the previous cycle: the per-frame
    /// scratch scope is dropped (LIFO) and every class's demand
    /// counter is zeroed, while backing objects stay at their
    /// high-water capacity. Then transitions `Initial -> Reserving`.
    ///
    /// # Errors
    /// Fatal [`ArenaError::InvalidState`] from any state other than
    /// `Initial` or `Frozen`.
    pub fn begin_frame(&self) -> Result<(), ArenaError> {
        let mut guard = self.inner.lock();
        if guard.state == FrameState::Frozen {
            let scratch = std::mem::take(&mut guard.scratch);
            for class in guard.slices.values_mut() {
                class.needed_size = 0;
            }
            for class in guard.descriptors.values_mut() {
                class.needed = 0;
            }
            for class in guard.images.values_mut() {
                class.needed_size = 0;
            }
            for class in guard.memories.values_mut() {
                class.needed_size = 0;
                class.must_grow = false;
            }
            guard.state = FrameState::Initial;
            drop(guard);
            // Scratch values may run arbitrary drop code.
            drop(scratch);
            guard = self.inner.lock();
        }
        self.require_state(&guard, FrameState::Initial)?;
        guard.state = FrameState::Reserving;
        log::trace!("instance {}: begin frame", self.index);
        Ok(())
    }

    /// Declare `size` more bytes of demand for the `usage` scratch
    /// slice. Additive; callable from any thread while `Reserving`.
    ///
    /// The request is rounded up to the class's alignment, queried
    /// from the backend on the tag's first ever reservation.
    ///
    /// # Errors
    /// Fatal [`ArenaError::InvalidState`] outside `Reserving`; fatal
    /// backend error if the alignment probe fails.
    pub fn reserve_slice(&self, usage: BufferUsage, size: u64) -> Result<(), ArenaError> {
        {
            let mut guard = self.inner.lock();
            self.require_state(&guard, FrameState::Reserving)?;
            if let Some(class) = guard.slices.get_mut(&usage) {
                class.needed_size += align_up(size, class.alignment);
                return Ok(());
            }
        }

        // First reservation of this tag: probe the backend for the
        // tag's alignment outside the lock.
        let probe = self.core.allocator.alloc_buffer(usage, size, true)?;
        let mut probe = Some(probe);
        let mut guard = self.inner.lock();
        self.require_state(&guard, FrameState::Reserving)?;
        match guard.slices.get_mut(&usage) {
            Some(class) => {
                // Lost the probe race; the spare buffer is dropped
                // after the guard releases.
                class.needed_size += align_up(size, class.alignment);
            }
            None => {
                let Some(buffer) = probe.take() else {
                    return Err(self.core.sink.fatal(ArenaError::NotBound));
                };
                let alignment = buffer.alignment();
                let memory_type = buffer.memory_type();
                let _ = guard.slices.insert(
                    usage,
                    SliceClass {
                        needed_size: align_up(size, alignment),
                        used_size: 0,
                        alignment,
                        memory_type,
                        backing: Some(buffer),
                    },
                );
            }
        }
        drop(guard);
        drop(probe);
        Ok(())
    }

    /// Declare demand for one more descriptor set of `layout`.
    ///
    /// # Errors
    /// Fatal [`ArenaError::InvalidState`] outside `Reserving`.
    pub fn reserve_descriptor(&self, layout: &Arc<DescriptorLayout>) -> Result<(), ArenaError> {
        let mut guard = self.inner.lock();
        self.require_state(&guard, FrameState::Reserving)?;
        let class = guard
            .descriptors
            .entry(layout.key())
            .or_insert_with(|| DescriptorClass {
                pool: None,
                layout: Arc::clone(layout),
                needed: 0,
                used: 0,
                sets: Vec::new(),
            });
        class.needed += 1;
        Ok(())
    }

    /// Declare demand for the transient image identified by `key`.
    ///
    /// The image object is created eagerly (to learn its size and
    /// alignment) but bound to memory only at commit. `ranges` lists
    /// the views to precompute; `usage`, `desc`, and `ranges` are
    /// fixed by the key's first reservation.
    ///
    /// # Errors
    /// Fatal [`ArenaError::InvalidState`] outside `Reserving`; fatal
    /// backend error if image creation fails.
    pub fn reserve_image(
        &self,
        key: Key,
        usage: ImageUsage,
        desc: &ImageDescription,
        ranges: &[ImageRange],
    ) -> Result<(), ArenaError> {
        {
            let mut guard = self.inner.lock();
            self.require_state(&guard, FrameState::Reserving)?;
            if let Some(class) = guard.images.get_mut(&key) {
                if let Some(image) = &class.image {
                    class.needed_size = align_up(image.size(), image.alignment());
                    return Ok(());
                }
            }
        }

        let probe = self.core.allocator.alloc_image(usage, desc)?;
        let mut probe = Some(probe);
        let mut guard = self.inner.lock();
        self.require_state(&guard, FrameState::Reserving)?;
        let class = guard.images.entry(key).or_insert_with(|| ImageClass {
            image: None,
            usage,
            desc: *desc,
            needed_size: 0,
            ranges: ranges.to_vec(),
            views: Vec::new(),
        });
        if class.image.is_none() {
            class.image = probe.take();
            class.usage = usage;
            class.desc = *desc;
            class.ranges = ranges.to_vec();
        }
        if let Some(image) = &class.image {
            class.needed_size = align_up(image.size(), image.alignment());
        }
        drop(guard);
        drop(probe);
        Ok(())
    }

    /// Close reservations and make the declared demand concrete.
    ///
    /// In order: descriptor pools grow where `needed` exceeds their
    /// capacity; per-memory-class demand is summed and blocks grow
    /// where the total exceeds theirs; slice buffers and images of
    /// grown classes are rebuilt and rebound at fresh offsets. Classes
    /// whose demand fits inside existing capacity are untouched; a
    /// warmed-up instance commits with zero backend calls. Old backing
    /// objects are released only after every rebind succeeded.
    ///
    /// Transitions `Reserving -> Committing -> Allocating`.
    ///
    /// # Errors
    /// Fatal [`ArenaError::InvalidState`] outside `Reserving`; fatal
    /// backend errors leave the instance in `Committing`, unusable.
    pub fn commit(&self) -> Result<(), ArenaError> {
        let mut work = {
            let mut guard = self.inner.lock();
            self.require_state(&guard, FrameState::Reserving)?;
            guard.state = FrameState::Committing;
            CommitMaps {
                memories: std::mem::take(&mut guard.memories),
                slices: std::mem::take(&mut guard.slices),
                descriptors: std::mem::take(&mut guard.descriptors),
                images: std::mem::take(&mut guard.images),
            }
        };

        // Backend calls run with the lock released; producers are kept
        // out of the maps by the Committing state.
        let mut retired = Retired::default();
        let result = self.run_commit(&mut work, &mut retired);

        let mut guard = self.inner.lock();
        guard.memories = work.memories;
        guard.slices = work.slices;
        guard.descriptors = work.descriptors;
        guard.images = work.images;
        if result.is_ok() {
            guard.state = FrameState::Allocating;
        }
        drop(guard);
        drop(retired);
        if result.is_ok() {
            log::trace!("instance {}: committed", self.index);
        }
        result
    }

    fn run_commit(&self, work: &mut CommitMaps, retired: &mut Retired) -> Result<(), ArenaError> {
        self.commit_descriptors(work, retired)?;
        self.commit_memory(work, retired)?;
        self.commit_buffers(work, retired)?;
        self.commit_images(work, retired)
    }

    fn commit_descriptors(
        &self,
        work: &mut CommitMaps,
        retired: &mut Retired,
    ) -> Result<(), ArenaError> {
        for class in work.descriptors.values_mut() {
            if class.needed as usize > class.sets.len() {
                log::debug!(
                    "instance {}: descriptor pool for layout {:?} grows to {}",
                    self.index,
                    class.layout.key(),
                    class.needed
                );
                let pool = DescriptorPool::new(
                    self.core.allocator.backend(),
                    &class.layout,
                    class.needed,
                )
                .map_err(|e| self.core.sink.fatal(e))?;
                let mut sets = Vec::with_capacity(class.needed as usize);
                for _ in 0..class.needed {
                    sets.push(pool.alloc_set().map_err(|e| self.core.sink.fatal(e))?);
                }
                if let Some(old) = class.pool.take() {
                    retired.pools.push(old);
                }
                class.pool = Some(pool);
                class.sets = sets;
            }
            class.used = 0;
        }
        Ok(())
    }

    /// Sum slice/image demand into memory classes and (re)allocate any
    /// block whose capacity the new total exceeds.
    fn commit_memory(&self, work: &mut CommitMaps, retired: &mut Retired) -> Result<(), ArenaError> {
        for class in work.slices.values() {
            if class.needed_size == 0 {
                continue;
            }
            let key = MemKey {
                memory_type: class.memory_type,
                host_visible: true,
            };
            let m = work.memories.entry(key).or_default();
            m.needed_size = align_up(m.needed_size, class.alignment) + class.needed_size;
            let usable = class
                .backing
                .as_ref()
                .is_some_and(|b| b.is_bound() && b.size() >= class.needed_size);
            if !usable {
                m.must_grow = true;
            }
        }
        for class in work.images.values() {
            if class.needed_size == 0 {
                continue;
            }
            let Some(image) = &class.image else { continue };
            let key = MemKey {
                memory_type: image.memory_type(),
                host_visible: false,
            };
            let m = work.memories.entry(key).or_default();
            m.needed_size = align_up(m.needed_size, image.alignment()) + class.needed_size;
            if !image.is_bound() {
                m.must_grow = true;
            }
        }

        for (key, m) in &mut work.memories {
            m.used_size = 0;
            if m.needed_size == 0 {
                m.must_grow = false;
                continue;
            }
            let too_small = m.backing.as_ref().is_none_or(|b| b.size() < m.needed_size);
            if too_small {
                m.must_grow = true;
                if let Some(old) = m.backing.take() {
                    retired.memories.push(old);
                }
                log::debug!(
                    "instance {}: memory class {key:?} grows to {} bytes",
                    self.index,
                    m.needed_size
                );
                m.backing = Some(self.core.allocator.alloc_memory(
                    m.needed_size,
                    key.memory_type,
                    key.host_visible,
                )?);
            }
        }
        Ok(())
    }

    fn commit_buffers(&self, work: &mut CommitMaps, retired: &mut Retired) -> Result<(), ArenaError> {
        for (usage, class) in &mut work.slices {
            let key = MemKey {
                memory_type: class.memory_type,
                host_visible: true,
            };
            let must_grow = work.memories.get(&key).is_some_and(|m| m.must_grow);
            if class.needed_size == 0 {
                class.used_size = 0;
                if must_grow {
                    // The class sat this frame out while its block was
                    // replaced; its stale buffer must not survive.
                    if let Some(old) = class.backing.take() {
                        retired.buffers.push(old);
                    }
                }
                continue;
            }
            if must_grow {
                if let Some(old) = class.backing.take() {
                    retired.buffers.push(old);
                }
                let mut buffer =
                    self.core
                        .allocator
                        .alloc_buffer(*usage, class.needed_size, true)?;
                let Some(m) = work.memories.get_mut(&key) else {
                    return Err(self.core.sink.fatal(ArenaError::NotBound));
                };
                m.used_size = align_up(m.used_size, buffer.alignment());
                let offset = m.used_size;
                m.used_size += class.needed_size;
                let Some(block) = &m.backing else {
                    return Err(self.core.sink.fatal(ArenaError::NotBound));
                };
                buffer.bind(block, offset)?;
                log::debug!(
                    "instance {}: {usage:?} slice buffer rebuilt at {} bytes",
                    self.index,
                    class.needed_size
                );
                class.backing = Some(buffer);
            }
            class.used_size = 0;
        }
        Ok(())
    }

    fn commit_images(&self, work: &mut CommitMaps, retired: &mut Retired) -> Result<(), ArenaError> {
        for (image_key, class) in &mut work.images {
            let Some(memory_type) = class.image.as_ref().map(ArenaImage::memory_type) else {
                continue;
            };
            let key = MemKey {
                memory_type,
                host_visible: false,
            };
            let must_grow = work.memories.get(&key).is_some_and(|m| m.must_grow);
            if class.needed_size == 0 {
                if must_grow {
                    // Unreserved this frame but its block went away:
                    // retire and let a later reservation re-probe.
                    retired.views.append(&mut class.views);
                    if let Some(old) = class.image.take() {
                        retired.images.push(old);
                    }
                }
                continue;
            }
            if !must_grow {
                continue;
            }
            if class.image.as_ref().is_some_and(ArenaImage::is_bound) {
                // Bound images cannot be rebound; rebuild from the
                // recorded description.
                retired.views.append(&mut class.views);
                if let Some(old) = class.image.take() {
                    retired.images.push(old);
                }
                class.image = Some(self.core.allocator.alloc_image(class.usage, &class.desc)?);
            }
            let Some(m) = work.memories.get_mut(&key) else {
                return Err(self.core.sink.fatal(ArenaError::NotBound));
            };
            let Some(image) = class.image.as_mut() else {
                return Err(self.core.sink.fatal(ArenaError::UnknownImage));
            };
            m.used_size = align_up(m.used_size, image.alignment());
            let offset = m.used_size;
            m.used_size += class.needed_size;
            let Some(block) = &m.backing else {
                return Err(self.core.sink.fatal(ArenaError::NotBound));
            };
            image.bind(block, offset)?;
            class.views.clear();
            for range in &class.ranges {
                class.views.push(image.create_view(range)?);
            }
            log::debug!(
                "instance {}: image {image_key:?} bound, {} bytes, {} views",
                self.index,
                class.needed_size,
                class.views.len()
            );
        }
        Ok(())
    }

    /// Take the next `size` bytes of the committed `usage` slice.
    ///
    /// The returned range starts at the class's cursor (always a
    /// multiple of the class alignment); the cursor advances by `size`
    /// rounded up to that alignment.
    ///
    /// # Errors
    /// Fatal [`ArenaError::InvalidState`] outside `Allocating`; fatal
    /// [`ArenaError::SliceOverflow`] when the allocation would exceed
    /// what this frame reserved. Over-allocation is detected, never
    /// allowed to corrupt a neighbouring class.
    pub fn alloc_slice(&self, usage: BufferUsage, size: u64) -> Result<BufferSlice, ArenaError> {
        let mut guard = self.inner.lock();
        self.require_state(&guard, FrameState::Allocating)?;
        let Some(class) = guard.slices.get_mut(&usage) else {
            return Err(self.core.sink.fatal(ArenaError::SliceOverflow {
                usage,
                reserved: 0,
                requested: size,
            }));
        };
        let rounded = align_up(size, class.alignment);
        if class.used_size + rounded > class.needed_size {
            let requested = class.used_size + rounded;
            let reserved = class.needed_size;
            return Err(self.core.sink.fatal(ArenaError::SliceOverflow {
                usage,
                reserved,
                requested,
            }));
        }
        let Some(backing) = &class.backing else {
            return Err(self.core.sink.fatal(ArenaError::NotBound));
        };
        let slice = backing.slice(class.used_size, size)?;
        class.used_size += rounded;
        Ok(slice)
    }

    /// Take the next pre-allocated descriptor set of `layout`.
    ///
    /// # Errors
    /// Fatal [`ArenaError::InvalidState`] outside `Allocating`; fatal
    /// [`ArenaError::DescriptorOverflow`] past this frame's
    /// reservation count.
    pub fn alloc_descriptor(&self, layout: &Arc<DescriptorLayout>) -> Result<DescriptorSet, ArenaError> {
        let mut guard = self.inner.lock();
        self.require_state(&guard, FrameState::Allocating)?;
        let Some(class) = guard.descriptors.get_mut(&layout.key()) else {
            return Err(self
                .core
                .sink
                .fatal(ArenaError::DescriptorOverflow { reserved: 0 }));
        };
        let set = class
            .sets
            .get(class.used as usize)
            .filter(|_| class.used < class.needed)
            .copied();
        let Some(set) = set else {
            let reserved = class.needed;
            return Err(self.core.sink.fatal(ArenaError::DescriptorOverflow { reserved }));
        };
        class.used += 1;
        Ok(set)
    }

    /// The committed image and precomputed views for `key`.
    ///
    /// Unlike slices, images are fully materialized during commit;
    /// this just hands the handles out.
    ///
    /// # Errors
    /// Fatal [`ArenaError::InvalidState`] outside `Allocating`; fatal
    /// [`ArenaError::UnknownImage`] for a key not reserved this frame.
    pub fn alloc_image(&self, key: Key) -> Result<(ImageHandle, Vec<ImageViewHandle>), ArenaError> {
        let guard = self.inner.lock();
        self.require_state(&guard, FrameState::Allocating)?;
        let image = guard
            .images
            .get(&key)
            .filter(|class| class.needed_size > 0)
            .and_then(|class| {
                class
                    .image
                    .as_ref()
                    .map(|image| (image.handle(), class.views.iter().map(ArenaImageView::handle).collect()))
            });
        image.ok_or_else(|| self.core.sink.fatal(ArenaError::UnknownImage))
    }

    /// Mark the frame recorded. No resource is destroyed here; handles
    /// stay valid until this instance's next `begin_frame`.
    ///
    /// # Errors
    /// Fatal [`ArenaError::InvalidState`] outside `Allocating`.
    pub fn freeze(&self) -> Result<(), ArenaError> {
        let mut guard = self.inner.lock();
        self.require_state(&guard, FrameState::Allocating)?;
        guard.state = FrameState::Frozen;
        log::trace!("instance {}: frozen", self.index);
        Ok(())
    }

    /// Per-frame scratch value for `key`, constructed on first access
    /// this cycle and dropped at the next `begin_frame` cleanup.
    ///
    /// Same discipline as [`SharedCache`]: constructors may race and
    /// the loser's value is discarded, so they must be harmless to run
    /// twice. A key must always carry one value type.
    #[must_use]
    pub fn scratch<T, F>(&self, key: Key, ctor: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let existing = self.inner.lock().scratch.get(key).map(Arc::clone);
        if let Some(v) = existing {
            match v.downcast::<T>() {
                Ok(v) => return v,
                Err(_) => log::error!("scratch {key:?} reused with a different value type"),
            }
        }
        let fresh: Arc<T> = Arc::new(ctor());
        let mut guard = self.inner.lock();
        if let Some(v) = guard.scratch.get(key).map(Arc::clone) {
            if let Ok(v) = v.downcast::<T>() {
                return v;
            }
        }
        guard.scratch.set(key, Some(Arc::clone(&fresh) as ScratchValue));
        drop(guard);
        fresh
    }

    /// Replace (or with `None` clear) the scratch value for `key`.
    pub fn set_scratch<T>(&self, key: Key, value: Option<T>)
    where
        T: Send + Sync + 'static,
    {
        let erased = value.map(|v| Arc::new(v) as ScratchValue);
        let previous = {
            let mut guard = self.inner.lock();
            let previous = guard.scratch.get(key).map(Arc::clone);
            guard.scratch.set(key, erased);
            previous
        };
        drop(previous);
    }

    /// Adopt an anonymous value into the per-frame scope; dropped at
    /// the next `begin_frame` cleanup.
    pub fn add_scratch<T>(&self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.inner.lock().scratch.add(Arc::new(value));
    }

    /// Device-wide shared value for `key`, memoized across all
    /// instances and threads (see [`SharedCache`]).
    #[must_use]
    pub fn shared<T, F>(&self, key: Key, ctor: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        self.core.cache.get_or_insert_with(key, ctor)
    }
}

// ---------------------------------------------------------------------------
// FrameCache
// ---------------------------------------------------------------------------

/// Top-level arena: the device allocator, the shared cache, and a
/// fixed ring of frame instances.
///
/// Created once per device; dropping it releases every backing object
/// (instances first, shared cache, then the allocator).
pub struct FrameCache {
    instances: Vec<FrameInstance>,
    core: Arc<Shared>,
    next: AtomicUsize,
}

impl FrameCache {
    /// Arena with `instances` frames in flight (minimum 1) on the
    /// given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn DeviceBackend>, instances: usize) -> Self {
        let sink = Arc::new(ErrorSink::new());
        let core = Arc::new(Shared {
            cache: SharedCache::new(),
            allocator: DeviceAllocator::new(backend, Arc::clone(&sink)),
            sink,
        });
        let total = instances.max(1);
        let instances = (0..total)
            .map(|index| FrameInstance::new(index, total, Arc::clone(&core)))
            .collect();
        Self {
            instances,
            core,
            next: AtomicUsize::new(0),
        }
    }

    /// The frame ring.
    #[must_use]
    pub fn instances(&self) -> &[FrameInstance] {
        &self.instances
    }

    /// Round-robin pick of the next instance. The caller still drives
    /// its phase cycle, starting with `begin_frame`.
    #[must_use]
    pub fn next_instance(&self) -> &FrameInstance {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.instances.len();
        &self.instances[i]
    }

    /// Device-wide shared value for `key` (see [`SharedCache`]).
    #[must_use]
    pub fn shared<T, F>(&self, key: Key, ctor: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        self.core.cache.get_or_insert_with(key, ctor)
    }

    /// The underlying device allocator, for non-transient allocations
    /// that share the arena's backend and fatal reporting.
    #[must_use]
    pub fn allocator(&self) -> &DeviceAllocator {
        &self.core.allocator
    }

    /// Install or clear the device-wide fatal error hook.
    ///
    /// The hook may run while internal locks are held; it must report
    /// and get out, never call back into the arena.
    pub fn set_fatal_hook(&self, hook: Option<FatalHook>) {
        self.core.sink.set_hook(hook);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::backend::{HeadlessBackend, ImageFormat};
    use crate::descriptor::{DescriptorBinding, DescriptorType};

    fn setup(instances: usize) -> (Arc<HeadlessBackend>, FrameCache) {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = Arc::new(HeadlessBackend::new());
        let cache = FrameCache::new(
            Arc::clone(&backend) as Arc<dyn DeviceBackend>,
            instances,
        );
        (backend, cache)
    }

    fn uniform_layout() -> Arc<DescriptorLayout> {
        DescriptorLayout::new(vec![DescriptorBinding {
            descriptor_type: DescriptorType::UniformBuffer,
            count: 1,
        }])
    }

    /// Runs one full frame with a fixed demand profile.
    fn run_frame(
        instance: &FrameInstance,
        layout: &Arc<DescriptorLayout>,
    ) -> Result<(), ArenaError> {
        instance.begin_frame()?;
        instance.reserve_slice(BufferUsage::Uniform, 256)?;
        instance.reserve_slice(BufferUsage::Vertex, 128)?;
        instance.reserve_descriptor(layout)?;
        instance.commit()?;
        let _ = instance.alloc_slice(BufferUsage::Uniform, 256)?;
        let _ = instance.alloc_slice(BufferUsage::Vertex, 128)?;
        let _ = instance.alloc_descriptor(layout)?;
        instance.freeze()
    }

    #[test]
    fn test_steady_state_frames_make_no_backend_calls() {
        let (backend, cache) = setup(3);
        let layout = uniform_layout();

        // Warm every instance once.
        for _ in 0..3 {
            run_frame(cache.next_instance(), &layout).unwrap();
        }
        let warmed = backend.counters().total_allocations();

        for _ in 0..9 {
            run_frame(cache.next_instance(), &layout).unwrap();
        }
        assert_eq!(backend.counters().total_allocations(), warmed);
    }

    #[test]
    fn test_growth_allocates_once_and_retires_old_backing() {
        let (backend, cache) = setup(1);
        let instance = cache.next_instance();

        instance.begin_frame().unwrap();
        instance.reserve_slice(BufferUsage::Uniform, 256).unwrap();
        instance.commit().unwrap();
        let small = instance.alloc_slice(BufferUsage::Uniform, 256).unwrap();
        instance.freeze().unwrap();
        let before = backend.counters();

        instance.begin_frame().unwrap();
        instance.reserve_slice(BufferUsage::Uniform, 512).unwrap();
        instance.commit().unwrap();
        let big = instance.alloc_slice(BufferUsage::Uniform, 512).unwrap();
        instance.freeze().unwrap();
        let after = backend.counters();

        assert_eq!(after.memory_allocs, before.memory_allocs + 1);
        assert_eq!(after.memory_frees, before.memory_frees + 1);
        assert_eq!(after.buffer_creates, before.buffer_creates + 1);
        assert_eq!(after.buffer_destroys, before.buffer_destroys + 1);
        assert_ne!(small.buffer(), big.buffer());
        assert!(!backend.buffer_is_live(small.buffer()));
        assert!(backend.buffer_is_live(big.buffer()));
    }

    #[test]
    fn test_shrinking_demand_reuses_high_water_capacity() {
        let (backend, cache) = setup(1);
        let instance = cache.next_instance();

        instance.begin_frame().unwrap();
        instance.reserve_slice(BufferUsage::Uniform, 1024).unwrap();
        instance.commit().unwrap();
        instance.freeze().unwrap();
        let warmed = backend.counters().total_allocations();

        instance.begin_frame().unwrap();
        instance.reserve_slice(BufferUsage::Uniform, 128).unwrap();
        instance.commit().unwrap();
        let slice = instance.alloc_slice(BufferUsage::Uniform, 128).unwrap();
        instance.freeze().unwrap();

        assert_eq!(backend.counters().total_allocations(), warmed);
        assert_eq!(slice.len(), 128);
    }

    #[test]
    fn test_slice_offsets_respect_class_alignment() {
        let (_backend, cache) = setup(1);
        let instance = cache.next_instance();

        instance.begin_frame().unwrap();
        for _ in 0..3 {
            instance.reserve_slice(BufferUsage::Uniform, 10).unwrap();
            instance.reserve_slice(BufferUsage::Vertex, 10).unwrap();
        }
        instance.commit().unwrap();

        // Uniform alignment is 256, vertex 16.
        let uniform: Vec<u64> = (0..3)
            .map(|_| instance.alloc_slice(BufferUsage::Uniform, 10).unwrap().offset())
            .collect();
        let vertex: Vec<u64> = (0..3)
            .map(|_| instance.alloc_slice(BufferUsage::Vertex, 10).unwrap().offset())
            .collect();
        assert_eq!(uniform, vec![0, 256, 512]);
        assert_eq!(vertex, vec![0, 16, 32]);
        instance.freeze().unwrap();
    }

    #[test]
    fn test_frozen_resources_survive_other_instances_frames() {
        let (backend, cache) = setup(3);
        let layout = uniform_layout();

        let first = cache.next_instance();
        first.begin_frame().unwrap();
        first.reserve_slice(BufferUsage::Uniform, 64).unwrap();
        first.commit().unwrap();
        let slice = first.alloc_slice(BufferUsage::Uniform, 64).unwrap();
        slice.write_bytes(&[0xAB; 64]).unwrap();
        first.freeze().unwrap();

        // Two other frames, each with their own growth.
        run_frame(cache.next_instance(), &layout).unwrap();
        run_frame(cache.next_instance(), &layout).unwrap();

        // Nothing of the frozen frame was reclaimed.
        assert_eq!(backend.counters().memory_frees, 0);
        assert_eq!(slice.bytes().unwrap(), &[0xAB; 64][..]);

        // The instance's own next cycle with higher demand is what
        // replaces its block.
        first.begin_frame().unwrap();
        first.reserve_slice(BufferUsage::Uniform, 4096).unwrap();
        first.commit().unwrap();
        assert_eq!(backend.counters().memory_frees, 1);
        instance_finish(first);
    }

    fn instance_finish(instance: &FrameInstance) {
        let _ = instance.alloc_slice(BufferUsage::Uniform, 4096).unwrap();
        instance.freeze().unwrap();
    }

    #[test]
    fn test_out_of_phase_calls_are_fatal_and_hooked() {
        let (_backend, cache) = setup(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let hook_hits = Arc::clone(&hits);
        cache.set_fatal_hook(Some(Box::new(move |_| {
            let _ = hook_hits.fetch_add(1, Ordering::SeqCst);
        })));
        let instance = cache.next_instance();
        let layout = uniform_layout();
        assert_eq!(instance.index(), (0, 1));
        assert_eq!(instance.state(), FrameState::Initial);

        // Reserve before begin_frame.
        assert!(matches!(
            instance.reserve_slice(BufferUsage::Uniform, 16),
            Err(ArenaError::InvalidState { .. })
        ));
        instance.begin_frame().unwrap();
        assert_eq!(instance.state(), FrameState::Reserving);
        // Alloc while still reserving.
        assert!(matches!(
            instance.alloc_slice(BufferUsage::Uniform, 16),
            Err(ArenaError::InvalidState { .. })
        ));
        // Freeze while still reserving.
        assert!(instance.freeze().is_err());
        instance.commit().unwrap();
        // Double commit.
        assert!(instance.commit().is_err());
        // Reserve after commit.
        assert!(instance.reserve_descriptor(&layout).is_err());
        instance.freeze().unwrap();
        // begin_frame from Frozen is fine, twice is not.
        instance.begin_frame().unwrap();
        assert!(instance.begin_frame().is_err());

        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_descriptor_pool_reused_until_demand_exceeds_capacity() {
        let (backend, cache) = setup(1);
        let instance = cache.next_instance();
        let layout = uniform_layout();

        instance.begin_frame().unwrap();
        instance.reserve_descriptor(&layout).unwrap();
        instance.reserve_descriptor(&layout).unwrap();
        instance.commit().unwrap();
        let first = instance.alloc_descriptor(&layout).unwrap();
        let _ = instance.alloc_descriptor(&layout).unwrap();
        assert!(matches!(
            instance.alloc_descriptor(&layout),
            Err(ArenaError::DescriptorOverflow { reserved: 2 })
        ));
        instance.freeze().unwrap();
        assert_eq!(backend.counters().pool_creates, 1);

        // Fewer sets next frame: same pool, same first set, and the
        // overflow bound is this frame's reservation, not the pool's
        // larger capacity.
        instance.begin_frame().unwrap();
        instance.reserve_descriptor(&layout).unwrap();
        instance.commit().unwrap();
        assert_eq!(instance.alloc_descriptor(&layout).unwrap(), first);
        assert!(matches!(
            instance.alloc_descriptor(&layout),
            Err(ArenaError::DescriptorOverflow { reserved: 1 })
        ));
        instance.freeze().unwrap();
        assert_eq!(backend.counters().pool_creates, 1);

        // More sets than capacity: pool is rebuilt.
        instance.begin_frame().unwrap();
        for _ in 0..3 {
            instance.reserve_descriptor(&layout).unwrap();
        }
        instance.commit().unwrap();
        for _ in 0..3 {
            let _ = instance.alloc_descriptor(&layout).unwrap();
        }
        instance.freeze().unwrap();
        let counters = backend.counters();
        assert_eq!(counters.pool_creates, 2);
        assert_eq!(counters.pool_destroys, 1);
    }

    #[test]
    fn test_images_committed_with_views_and_reused() {
        let (backend, cache) = setup(1);
        let instance = cache.next_instance();
        let key = Key::new();
        let desc = ImageDescription {
            width: 256,
            height: 256,
            depth: 1,
            format: ImageFormat::R8g8b8a8Unorm,
            layers: 1,
            mip_levels: 2,
        };
        let ranges = [
            desc.full_range(),
            ImageRange {
                first_mip_level: 1,
                level_count: 1,
                first_layer: 0,
                layer_count: 1,
            },
        ];

        instance.begin_frame().unwrap();
        instance
            .reserve_image(key, ImageUsage::SAMPLED | ImageUsage::COLOR_ATTACHMENT, &desc, &ranges)
            .unwrap();
        instance.commit().unwrap();
        let (image, views) = instance.alloc_image(key).unwrap();
        assert_eq!(views.len(), 2);
        assert!(backend.image_is_live(image));
        instance.freeze().unwrap();
        let warmed = backend.counters();

        // A dormant frame followed by a reserving one: the image and
        // its views persist, no backend traffic at all.
        instance.begin_frame().unwrap();
        instance.commit().unwrap();
        assert!(matches!(
            instance.alloc_image(key),
            Err(ArenaError::UnknownImage)
        ));
        instance.freeze().unwrap();

        instance.begin_frame().unwrap();
        instance
            .reserve_image(key, ImageUsage::SAMPLED, &desc, &[])
            .unwrap();
        instance.commit().unwrap();
        let (again, views) = instance.alloc_image(key).unwrap();
        assert_eq!(again, image);
        assert_eq!(views.len(), 2);
        instance.freeze().unwrap();

        assert_eq!(
            backend.counters().total_allocations(),
            warmed.total_allocations()
        );
    }

    #[test]
    fn test_cleanup_zeroes_demand_but_keeps_capacity() {
        let (backend, cache) = setup(1);
        let instance = cache.next_instance();

        instance.begin_frame().unwrap();
        instance.reserve_slice(BufferUsage::Storage, 640).unwrap();
        instance.commit().unwrap();
        let _ = instance.alloc_slice(BufferUsage::Storage, 640).unwrap();
        instance.freeze().unwrap();
        let warmed = backend.counters().total_allocations();

        // An empty frame: capacity stays, but nothing was reserved so
        // nothing may be allocated.
        instance.begin_frame().unwrap();
        instance.commit().unwrap();
        assert!(matches!(
            instance.alloc_slice(BufferUsage::Storage, 64),
            Err(ArenaError::SliceOverflow { reserved: 0, .. })
        ));
        instance.freeze().unwrap();
        assert_eq!(backend.counters().total_allocations(), warmed);
        assert_eq!(backend.counters().buffer_destroys, 1); // probe only
    }

    #[test]
    fn test_scratch_scope_reclaimed_at_next_begin_frame() {
        struct Flagged(Arc<AtomicBool>);
        impl Drop for Flagged {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let (_backend, cache) = setup(2);
        let key = Key::new();
        let dropped = Arc::new(AtomicBool::new(false));

        let first = cache.next_instance();
        first.begin_frame().unwrap();
        let flag = Arc::clone(&dropped);
        let value = first.scratch(key, move || Flagged(flag));
        drop(value);
        first.commit().unwrap();
        first.freeze().unwrap();

        // The other instance's frame does not touch it.
        let second = cache.next_instance();
        second.begin_frame().unwrap();
        second.commit().unwrap();
        second.freeze().unwrap();
        assert!(!dropped.load(Ordering::SeqCst));

        first.begin_frame().unwrap();
        assert!(dropped.load(Ordering::SeqCst));

        // Explicitly managed scratch follows the same scope rules.
        let replaced = Arc::new(AtomicBool::new(false));
        first.set_scratch(key, Some(Flagged(Arc::clone(&replaced))));
        first.add_scratch(7_u32);
        first.set_scratch(key, None::<Flagged>);
        assert!(replaced.load(Ordering::SeqCst), "cleared scratch drops right away");
        first.commit().unwrap();
        first.freeze().unwrap();
    }

    #[test]
    fn test_ring_warmup_keeps_per_instance_backings_independent() {
        struct Flagged(Arc<AtomicBool>);
        impl Drop for Flagged {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let (backend, cache) = setup(3);
        let layout = uniform_layout();
        let reclaimed = Arc::new(AtomicBool::new(false));

        // Cycle 1, first instance: one uniform slice, one descriptor.
        let first = cache.next_instance();
        first.begin_frame().unwrap();
        first.reserve_slice(BufferUsage::Uniform, 256).unwrap();
        first.reserve_descriptor(&layout).unwrap();
        first.add_scratch(Flagged(Arc::clone(&reclaimed)));
        first.commit().unwrap();
        let slice = first.alloc_slice(BufferUsage::Uniform, 256).unwrap();
        assert_eq!(slice.offset(), 0);
        let _ = first.alloc_descriptor(&layout).unwrap();
        assert!(
            first.alloc_descriptor(&layout).is_err(),
            "pool sized to the reservation"
        );
        first.freeze().unwrap();

        // Cycle 2, second instance: double the slice demand. Its
        // backings are its own; the first instance's are untouched.
        let second = cache.next_instance();
        second.begin_frame().unwrap();
        second.reserve_slice(BufferUsage::Uniform, 256).unwrap();
        second.reserve_slice(BufferUsage::Uniform, 256).unwrap();
        second.commit().unwrap();
        let offsets = [
            second.alloc_slice(BufferUsage::Uniform, 256).unwrap().offset(),
            second.alloc_slice(BufferUsage::Uniform, 256).unwrap().offset(),
        ];
        assert_eq!(offsets, [0, 256]);
        second.freeze().unwrap();

        // Cycle 3, third instance: empty frame advances the ring.
        let third = cache.next_instance();
        third.begin_frame().unwrap();
        third.commit().unwrap();
        third.freeze().unwrap();

        let warmed = backend.counters();
        assert!(!reclaimed.load(Ordering::SeqCst));

        // Cycle 4, first instance again with cycle 1's demand: existing
        // backings satisfy it, only the frame scope is reclaimed.
        first.begin_frame().unwrap();
        assert!(reclaimed.load(Ordering::SeqCst));
        first.reserve_slice(BufferUsage::Uniform, 256).unwrap();
        first.reserve_descriptor(&layout).unwrap();
        first.commit().unwrap();
        let again = first.alloc_slice(BufferUsage::Uniform, 256).unwrap();
        assert_eq!(again.buffer(), slice.buffer());
        let _ = first.alloc_descriptor(&layout).unwrap();
        first.freeze().unwrap();

        let after = backend.counters();
        assert_eq!(after.total_allocations(), warmed.total_allocations());
        assert_eq!(after.memory_frees, warmed.memory_frees);
    }

    #[test]
    fn test_shared_value_constructed_once_across_instances() {
        let (_backend, cache) = setup(3);
        let key = Key::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for instance in cache.instances() {
            let runs = Arc::clone(&runs);
            let value = instance.shared(key, move || {
                let _ = runs.fetch_add(1, Ordering::SeqCst);
                42u32
            });
            assert_eq!(*value, 42);
        }
        // The cache-level entry point reaches the same store.
        assert_eq!(*cache.shared(key, || 0_u32), 42);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_reservation_sums_exactly() {
        let (_backend, cache) = setup(1);
        let instance = cache.next_instance();
        let layout = uniform_layout();

        instance.begin_frame().unwrap();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let layout = &layout;
                let _ = scope.spawn(move || {
                    for _ in 0..50 {
                        instance.reserve_slice(BufferUsage::Uniform, 256).unwrap();
                        instance.reserve_descriptor(layout).unwrap();
                    }
                });
            }
        });
        instance.commit().unwrap();

        let mut offsets = Vec::with_capacity(400);
        for _ in 0..400 {
            offsets.push(instance.alloc_slice(BufferUsage::Uniform, 256).unwrap().offset());
        }
        assert!(matches!(
            instance.alloc_slice(BufferUsage::Uniform, 256),
            Err(ArenaError::SliceOverflow { .. })
        ));
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), 400);
        assert!(offsets.iter().all(|o| o % 256 == 0));

        for _ in 0..400 {
            let _ = instance.alloc_descriptor(&layout).unwrap();
        }
        assert!(instance.alloc_descriptor(&layout).is_err());
        instance.freeze().unwrap();
    }

    #[test]
    fn test_drop_releases_every_backend_object() {
        let (backend, cache) = setup(2);
        let layout = uniform_layout();
        let key = Key::new();
        let desc = ImageDescription::d2(64, 64, ImageFormat::D32Sfloat);

        for _ in 0..4 {
            let instance = cache.next_instance();
            instance.begin_frame().unwrap();
            instance.reserve_slice(BufferUsage::Uniform, 256).unwrap();
            instance.reserve_descriptor(&layout).unwrap();
            instance
                .reserve_image(key, ImageUsage::DEPTH_ATTACHMENT, &desc, &[desc.full_range()])
                .unwrap();
            instance.commit().unwrap();
            let _ = instance.alloc_slice(BufferUsage::Uniform, 256).unwrap();
            let _ = instance.alloc_descriptor(&layout).unwrap();
            let _ = instance.alloc_image(key).unwrap();
            instance.freeze().unwrap();
        }

        // Long-lived objects from the exposed allocator count too.
        let mem = cache.allocator().alloc_memory(64, 1, true).unwrap();
        drop(mem);

        drop(cache);
        assert_eq!(backend.live_object_count(), 0);
    }
}
