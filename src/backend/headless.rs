//! Fully validating in-memory device backend.
//!
//! Stands in for a real graphics device in tests and headless tools:
//! it hands out real heap blocks for host-visible memory (with stable
//! mapped pointers), validates every bind against size, alignment, and
//! memory type, and keeps monotonic call counters so arena tests can
//! assert the zero-allocation steady state and monotonic growth.
//! Freed host blocks are poisoned with `0xDD` before release so
//! use-after-free shows up loudly.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;

use super::{
    BackendError, BufferHandle, BufferRequirements, BufferUsage, DescriptorPoolHandle,
    DescriptorSetHandle, DeviceBackend, ImageDescription, ImageHandle, ImageRange,
    ImageRequirements, ImageUsage, ImageViewHandle, MemoryAllocation, MemoryHandle,
};
use crate::descriptor::DescriptorLayout;

const DEVICE_LOCAL_TYPE: u32 = 0;
const HOST_VISIBLE_TYPE: u32 = 1;
const IMAGE_ALIGNMENT: u64 = 4096;

/// Monotonic backend call counters.
///
/// Only creations and destructions are counted; steady-state frames
/// must leave every `*_creates`/`*_allocs` field unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCounters {
    /// Memory blocks allocated.
    pub memory_allocs: u64,
    /// Memory blocks freed.
    pub memory_frees: u64,
    /// Buffers created.
    pub buffer_creates: u64,
    /// Buffers destroyed.
    pub buffer_destroys: u64,
    /// Buffer bind calls.
    pub buffer_binds: u64,
    /// Images created.
    pub image_creates: u64,
    /// Images destroyed.
    pub image_destroys: u64,
    /// Image bind calls.
    pub image_binds: u64,
    /// Image views created.
    pub view_creates: u64,
    /// Image views destroyed.
    pub view_destroys: u64,
    /// Descriptor pools created.
    pub pool_creates: u64,
    /// Descriptor pools destroyed.
    pub pool_destroys: u64,
    /// Descriptor sets allocated.
    pub set_allocs: u64,
}

impl BackendCounters {
    /// Sum of every allocation-side counter; flat across a frame means
    /// the frame committed without touching the device.
    #[must_use]
    pub const fn total_allocations(&self) -> u64 {
        self.memory_allocs + self.buffer_creates + self.image_creates + self.pool_creates
    }
}

/// Heap backing for one host-visible block. `UnsafeCell` sanctions the
/// raw-pointer writes producers perform through the mapped span.
struct HostBlock {
    cells: Box<[UnsafeCell<u8>]>,
}

impl HostBlock {
    fn new(size: usize) -> Self {
        Self {
            cells: (0..size).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    fn base(&self) -> NonNull<u8> {
        NonNull::new(self.cells.as_ptr().cast_mut().cast::<u8>())
            .unwrap_or_else(NonNull::dangling)
    }
}

struct MemoryRecord {
    size: u64,
    memory_type: u32,
    block: Option<HostBlock>,
}

struct BufferRecord {
    size: u64,
    alignment: u64,
    memory_type: u32,
    bound: bool,
}

struct ImageRecord {
    size: u64,
    alignment: u64,
    memory_type: u32,
    layers: u32,
    mip_levels: u32,
    bound: bool,
}

struct PoolRecord {
    capacity: u32,
    allocated: u32,
}

#[derive(Default)]
struct State {
    next_id: u64,
    budget: Option<u64>,
    budget_used: u64,
    memories: FxHashMap<u64, MemoryRecord>,
    buffers: FxHashMap<u64, BufferRecord>,
    images: FxHashMap<u64, ImageRecord>,
    views: FxHashMap<u64, u64>,
    pools: FxHashMap<u64, PoolRecord>,
    counters: BackendCounters,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory [`DeviceBackend`] with full bind validation.
pub struct HeadlessBackend {
    state: Mutex<State>,
}

impl HeadlessBackend {
    /// Backend with no memory budget.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the call counters.
    #[must_use]
    pub fn counters(&self) -> BackendCounters {
        self.lock().counters
    }

    /// Cap total live memory; allocations past the cap fail with
    /// [`BackendError::OutOfMemory`]. `None` lifts the cap.
    pub fn set_memory_budget(&self, budget: Option<u64>) {
        self.lock().budget = budget;
    }

    /// Live backend objects of every kind (leak check).
    #[must_use]
    pub fn live_object_count(&self) -> usize {
        let state = self.lock();
        state.memories.len()
            + state.buffers.len()
            + state.images.len()
            + state.views.len()
            + state.pools.len()
    }

    /// True while the block has not been freed.
    #[must_use]
    pub fn memory_is_live(&self, memory: MemoryHandle) -> bool {
        self.lock().memories.contains_key(&memory.0)
    }

    /// True while the buffer has not been destroyed.
    #[must_use]
    pub fn buffer_is_live(&self, buffer: BufferHandle) -> bool {
        self.lock().buffers.contains_key(&buffer.0)
    }

    /// True while the image has not been destroyed.
    #[must_use]
    pub fn image_is_live(&self, image: ImageHandle) -> bool {
        self.lock().images.contains_key(&image.0)
    }

    /// True while the pool has not been destroyed.
    #[must_use]
    pub fn pool_is_live(&self, pool: DescriptorPoolHandle) -> bool {
        self.lock().pools.contains_key(&pool.0)
    }

    /// Copy bytes out of a live host-visible block (test observation).
    #[must_use]
    pub fn host_bytes(&self, memory: MemoryHandle, offset: u64, len: usize) -> Option<Vec<u8>> {
        let state = self.lock();
        let record = state.memories.get(&memory.0)?;
        let block = record.block.as_ref()?;
        if offset + len as u64 > record.size {
            return None;
        }
        let mut out = vec![0_u8; len];
        // SAFETY: range checked against the block size above; the block
        // stays alive for the duration of the copy because the state
        // lock is held.
        unsafe {
            std::ptr::copy_nonoverlapping(
                block.base().as_ptr().add(offset as usize),
                out.as_mut_ptr(),
                len,
            );
        }
        Some(out)
    }

    const fn buffer_alignment(usage: BufferUsage) -> u64 {
        match usage {
            BufferUsage::Uniform => 256,
            BufferUsage::Storage => 64,
            BufferUsage::Vertex | BufferUsage::Indirect => 16,
            BufferUsage::Index | BufferUsage::TransferSrc | BufferUsage::TransferDst => 4,
        }
    }

    const fn image_byte_size(desc: &ImageDescription) -> u64 {
        let bpp = desc.format.bytes_per_pixel();
        let mut total = 0_u64;
        let mut mip = 0;
        while mip < desc.mip_levels {
            let w = max_dim(desc.width >> mip);
            let h = max_dim(desc.height >> mip);
            let d = max_dim(desc.depth >> mip);
            total += w as u64 * h as u64 * d as u64 * desc.layers as u64 * bpp;
            mip += 1;
        }
        total
    }
}

const fn max_dim(v: u32) -> u32 {
    if v == 0 {
        1
    } else {
        v
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for HeadlessBackend {
    fn alloc_memory(
        &self,
        size: u64,
        memory_type: u32,
        host_visible: bool,
    ) -> Result<MemoryAllocation, BackendError> {
        let mut state = self.lock();
        if let Some(budget) = state.budget {
            if state.budget_used + size > budget {
                return Err(BackendError::OutOfMemory { requested: size });
            }
        }
        state.budget_used += size;
        let id = state.next_id();
        let block = host_visible.then(|| HostBlock::new(size as usize));
        let mapped = block.as_ref().map(HostBlock::base);
        let _ = state.memories.insert(
            id,
            MemoryRecord {
                size,
                memory_type,
                block,
            },
        );
        state.counters.memory_allocs += 1;
        Ok(MemoryAllocation {
            handle: MemoryHandle(id),
            mapped,
        })
    }

    fn free_memory(&self, memory: MemoryHandle) {
        let mut state = self.lock();
        if let Some(record) = state.memories.remove(&memory.0) {
            if let Some(block) = &record.block {
                // SAFETY: the block is exclusively owned here and about
                // to drop; poison so stale mapped pointers read garbage.
                unsafe {
                    std::ptr::write_bytes(block.base().as_ptr(), 0xDD, record.size as usize);
                }
            }
            state.budget_used = state.budget_used.saturating_sub(record.size);
            state.counters.memory_frees += 1;
        }
    }

    fn create_buffer(
        &self,
        usage: BufferUsage,
        size: u64,
        host_visible: bool,
    ) -> Result<BufferRequirements, BackendError> {
        let mut state = self.lock();
        let id = state.next_id();
        let alignment = Self::buffer_alignment(usage);
        let memory_type = if host_visible {
            HOST_VISIBLE_TYPE
        } else {
            DEVICE_LOCAL_TYPE
        };
        let _ = state.buffers.insert(
            id,
            BufferRecord {
                size,
                alignment,
                memory_type,
                bound: false,
            },
        );
        state.counters.buffer_creates += 1;
        Ok(BufferRequirements {
            handle: BufferHandle(id),
            size,
            alignment,
            memory_type,
        })
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.lock();
        if state.buffers.remove(&buffer.0).is_some() {
            state.counters.buffer_destroys += 1;
        }
    }

    fn bind_buffer(
        &self,
        buffer: BufferHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        let mem = state
            .memories
            .get(&memory.0)
            .map(|m| (m.size, m.memory_type))
            .ok_or(BackendError::InvalidHandle)?;
        let buf = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle)?;
        if buf.bound {
            return Err(BackendError::AlreadyBound);
        }
        if buf.memory_type != mem.1 {
            return Err(BackendError::MemoryTypeMismatch {
                expected: buf.memory_type,
                actual: mem.1,
            });
        }
        if offset % buf.alignment != 0 {
            return Err(BackendError::MisalignedOffset {
                offset,
                alignment: buf.alignment,
            });
        }
        if offset + buf.size > mem.0 {
            return Err(BackendError::RangeOverflow {
                needed: offset + buf.size,
                available: mem.0,
            });
        }
        buf.bound = true;
        state.counters.buffer_binds += 1;
        Ok(())
    }

    fn create_image(
        &self,
        usage: ImageUsage,
        desc: &ImageDescription,
    ) -> Result<ImageRequirements, BackendError> {
        let mut state = self.lock();
        let id = state.next_id();
        let size = Self::image_byte_size(desc);
        log::trace!("image {id}: {desc:?} usage {usage:?}, {size} bytes");
        let _ = state.images.insert(
            id,
            ImageRecord {
                size,
                alignment: IMAGE_ALIGNMENT,
                memory_type: DEVICE_LOCAL_TYPE,
                layers: desc.layers,
                mip_levels: desc.mip_levels,
                bound: false,
            },
        );
        state.counters.image_creates += 1;
        Ok(ImageRequirements {
            handle: ImageHandle(id),
            size,
            alignment: IMAGE_ALIGNMENT,
            memory_type: DEVICE_LOCAL_TYPE,
        })
    }

    fn destroy_image(&self, image: ImageHandle) {
        let mut state = self.lock();
        if state.images.remove(&image.0).is_some() {
            state.counters.image_destroys += 1;
        }
    }

    fn bind_image(
        &self,
        image: ImageHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        let mem = state
            .memories
            .get(&memory.0)
            .map(|m| (m.size, m.memory_type))
            .ok_or(BackendError::InvalidHandle)?;
        let img = state
            .images
            .get_mut(&image.0)
            .ok_or(BackendError::InvalidHandle)?;
        if img.bound {
            return Err(BackendError::AlreadyBound);
        }
        if img.memory_type != mem.1 {
            return Err(BackendError::MemoryTypeMismatch {
                expected: img.memory_type,
                actual: mem.1,
            });
        }
        if offset % img.alignment != 0 {
            return Err(BackendError::MisalignedOffset {
                offset,
                alignment: img.alignment,
            });
        }
        if offset + img.size > mem.0 {
            return Err(BackendError::RangeOverflow {
                needed: offset + img.size,
                available: mem.0,
            });
        }
        img.bound = true;
        state.counters.image_binds += 1;
        Ok(())
    }

    fn create_image_view(
        &self,
        image: ImageHandle,
        range: &ImageRange,
    ) -> Result<ImageViewHandle, BackendError> {
        let mut state = self.lock();
        let img = state
            .images
            .get(&image.0)
            .ok_or(BackendError::InvalidHandle)?;
        if !img.bound {
            // Views are only legal over bound images.
            return Err(BackendError::InvalidHandle);
        }
        if range.first_layer + range.layer_count > img.layers {
            return Err(BackendError::RangeOverflow {
                needed: u64::from(range.first_layer + range.layer_count),
                available: u64::from(img.layers),
            });
        }
        if range.first_mip_level + range.level_count > img.mip_levels {
            return Err(BackendError::RangeOverflow {
                needed: u64::from(range.first_mip_level + range.level_count),
                available: u64::from(img.mip_levels),
            });
        }
        let id = state.next_id();
        let _ = state.views.insert(id, image.0);
        state.counters.view_creates += 1;
        Ok(ImageViewHandle(id))
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        let mut state = self.lock();
        if state.views.remove(&view.0).is_some() {
            state.counters.view_destroys += 1;
        }
    }

    fn create_descriptor_pool(
        &self,
        layout: &DescriptorLayout,
        capacity: u32,
    ) -> Result<DescriptorPoolHandle, BackendError> {
        let mut state = self.lock();
        let id = state.next_id();
        log::trace!(
            "descriptor pool {id} for layout {:?}, capacity {capacity}",
            layout.key()
        );
        let _ = state.pools.insert(
            id,
            PoolRecord {
                capacity,
                allocated: 0,
            },
        );
        state.counters.pool_creates += 1;
        Ok(DescriptorPoolHandle(id))
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        let mut state = self.lock();
        if state.pools.remove(&pool.0).is_some() {
            state.counters.pool_destroys += 1;
        }
    }

    fn alloc_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
    ) -> Result<DescriptorSetHandle, BackendError> {
        let mut state = self.lock();
        let record = state
            .pools
            .get_mut(&pool.0)
            .ok_or(BackendError::InvalidHandle)?;
        if record.allocated >= record.capacity {
            return Err(BackendError::PoolExhausted {
                capacity: record.capacity,
            });
        }
        record.allocated += 1;
        let id = state.next_id();
        state.counters.set_allocs += 1;
        Ok(DescriptorSetHandle(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ImageFormat;
    use crate::descriptor::{DescriptorBinding, DescriptorType};

    fn layout() -> std::sync::Arc<DescriptorLayout> {
        DescriptorLayout::new(vec![DescriptorBinding {
            descriptor_type: DescriptorType::UniformBuffer,
            count: 1,
        }])
    }

    #[test]
    fn test_bind_buffer_validation() {
        let backend = HeadlessBackend::new();
        let mem = backend.alloc_memory(1024, HOST_VISIBLE_TYPE, true).unwrap();
        let buf = backend
            .create_buffer(BufferUsage::Uniform, 512, true)
            .unwrap();

        // Range overflow.
        assert_eq!(
            backend.bind_buffer(buf.handle, mem.handle, 768),
            Err(BackendError::RangeOverflow {
                needed: 1280,
                available: 1024
            })
        );
        // Misaligned offset (uniform alignment is 256).
        assert_eq!(
            backend.bind_buffer(buf.handle, mem.handle, 128),
            Err(BackendError::MisalignedOffset {
                offset: 128,
                alignment: 256
            })
        );
        // Happy path, then double bind.
        assert_eq!(backend.bind_buffer(buf.handle, mem.handle, 256), Ok(()));
        assert_eq!(
            backend.bind_buffer(buf.handle, mem.handle, 0),
            Err(BackendError::AlreadyBound)
        );
    }

    #[test]
    fn test_bind_memory_type_mismatch() {
        let backend = HeadlessBackend::new();
        let device_mem = backend
            .alloc_memory(4096, DEVICE_LOCAL_TYPE, false)
            .unwrap();
        let host_buf = backend
            .create_buffer(BufferUsage::Vertex, 64, true)
            .unwrap();
        assert_eq!(
            backend.bind_buffer(host_buf.handle, device_mem.handle, 0),
            Err(BackendError::MemoryTypeMismatch {
                expected: HOST_VISIBLE_TYPE,
                actual: DEVICE_LOCAL_TYPE
            })
        );
    }

    #[test]
    fn test_memory_budget() {
        let backend = HeadlessBackend::new();
        backend.set_memory_budget(Some(1024));
        let first = backend.alloc_memory(512, 0, false).unwrap();
        assert_eq!(
            backend.alloc_memory(768, 0, false).map(|a| a.handle),
            Err(BackendError::OutOfMemory { requested: 768 })
        );
        backend.free_memory(first.handle);
        assert!(backend.alloc_memory(768, 0, false).is_ok());
    }

    #[test]
    fn test_host_block_roundtrip_and_poison() {
        let backend = HeadlessBackend::new();
        let mem = backend.alloc_memory(16, HOST_VISIBLE_TYPE, true).unwrap();
        let mapped = mem.mapped.unwrap();
        // SAFETY: the block is live and 16 bytes long.
        unsafe { std::ptr::write_bytes(mapped.as_ptr(), 0xAB, 16) };
        assert_eq!(backend.host_bytes(mem.handle, 0, 4), Some(vec![0xAB; 4]));
        backend.free_memory(mem.handle);
        assert_eq!(backend.host_bytes(mem.handle, 0, 4), None);
        assert!(!backend.memory_is_live(mem.handle));
    }

    #[test]
    fn test_pool_exhaustion() {
        let backend = HeadlessBackend::new();
        let layout = layout();
        let pool = backend.create_descriptor_pool(&layout, 2).unwrap();
        assert!(backend.alloc_descriptor_set(pool).is_ok());
        assert!(backend.alloc_descriptor_set(pool).is_ok());
        assert_eq!(
            backend.alloc_descriptor_set(pool),
            Err(BackendError::PoolExhausted { capacity: 2 })
        );
    }

    #[test]
    fn test_image_view_requires_bound_image() {
        let backend = HeadlessBackend::new();
        let desc = ImageDescription::d2(64, 64, ImageFormat::R8g8b8a8Unorm);
        let img = backend
            .create_image(ImageUsage::COLOR_ATTACHMENT, &desc)
            .unwrap();
        assert_eq!(
            backend.create_image_view(img.handle, &desc.full_range()),
            Err(BackendError::InvalidHandle)
        );
        let mem = backend
            .alloc_memory(img.size, DEVICE_LOCAL_TYPE, false)
            .unwrap();
        backend.bind_image(img.handle, mem.handle, 0).unwrap();
        assert!(backend.create_image_view(img.handle, &desc.full_range()).is_ok());
    }
}
