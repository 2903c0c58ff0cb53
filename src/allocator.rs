//! Device memory, buffer, and image allocation.
//!
//! [`DeviceAllocator`] is the thin ownership layer over the backend's
//! allocation primitives: it allocates typed memory blocks, creates
//! unbound buffers/images with their placement requirements, and binds
//! them at offsets. It knows nothing about frames; the frame layer in
//! [`crate::frame`] drives it. Every failure here is fatal (reported
//! through the [`ErrorSink`], then returned).
//!
//! All returned objects release their backend handle on drop.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::backend::{
    BackendError, BufferHandle, BufferUsage, DeviceBackend, ImageDescription, ImageHandle,
    ImageRange, ImageUsage, ImageViewHandle, MemoryHandle,
};
use crate::error::{ArenaError, ErrorSink};

/// Round `value` up to the next multiple of `alignment` (0 and 1 leave
/// it unchanged).
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    let rem = value % alignment;
    if rem == 0 {
        value
    } else {
        value + (alignment - rem)
    }
}

/// Ownership layer over the backend's allocation primitives.
pub struct DeviceAllocator {
    backend: Arc<dyn DeviceBackend>,
    sink: Arc<ErrorSink>,
}

impl DeviceAllocator {
    /// Allocator over `backend`, reporting failures to `sink`.
    #[must_use]
    pub fn new(backend: Arc<dyn DeviceBackend>, sink: Arc<ErrorSink>) -> Self {
        Self { backend, sink }
    }

    /// Allocate a typed memory block.
    ///
    /// # Errors
    /// Fatal if the backend rejects the request (out of device memory).
    pub fn alloc_memory(
        &self,
        size: u64,
        memory_type: u32,
        host_visible: bool,
    ) -> Result<ArenaMemory, ArenaError> {
        match self.backend.alloc_memory(size, memory_type, host_visible) {
            Ok(allocation) => {
                log::trace!("memory block {:?}: {size} bytes, type {memory_type}, host {host_visible}", allocation.handle);
                Ok(ArenaMemory {
                    handle: allocation.handle,
                    mapped: allocation.mapped,
                    size,
                    memory_type,
                    backend: Arc::clone(&self.backend),
                })
            }
            Err(e) => Err(self.sink.fatal(e.into())),
        }
    }

    /// Create an unbound buffer; its size/alignment/memory-type
    /// metadata is available before binding.
    ///
    /// # Errors
    /// Fatal if the backend rejects the usage/size combination.
    pub fn alloc_buffer(
        &self,
        usage: BufferUsage,
        size: u64,
        host_visible: bool,
    ) -> Result<ArenaBuffer, ArenaError> {
        match self.backend.create_buffer(usage, size, host_visible) {
            Ok(req) => Ok(ArenaBuffer {
                handle: req.handle,
                usage,
                size: req.size,
                alignment: req.alignment,
                memory_type: req.memory_type,
                binding: None,
                backend: Arc::clone(&self.backend),
                sink: Arc::clone(&self.sink),
            }),
            Err(e) => Err(self.sink.fatal(e.into())),
        }
    }

    /// Create an unbound image; metadata available before binding.
    ///
    /// # Errors
    /// Fatal if the backend rejects the usage/description combination.
    pub fn alloc_image(
        &self,
        usage: ImageUsage,
        desc: &ImageDescription,
    ) -> Result<ArenaImage, ArenaError> {
        match self.backend.create_image(usage, desc) {
            Ok(req) => Ok(ArenaImage {
                handle: req.handle,
                usage,
                desc: *desc,
                size: req.size,
                alignment: req.alignment,
                memory_type: req.memory_type,
                bound: false,
                backend: Arc::clone(&self.backend),
                sink: Arc::clone(&self.sink),
            }),
            Err(e) => Err(self.sink.fatal(e.into())),
        }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }
}

// ---------------------------------------------------------------------------
// Memory blocks
// ---------------------------------------------------------------------------

/// An owned device memory block. Never resized in place: growth means
/// allocating a replacement and rebinding every resource.
pub struct ArenaMemory {
    handle: MemoryHandle,
    mapped: Option<NonNull<u8>>,
    size: u64,
    memory_type: u32,
    backend: Arc<dyn DeviceBackend>,
}

// SAFETY: the mapped pointer is owned by this block and only
// dereferenced through slices handed out by the frame layer, which
// guarantees disjoint ranges per producer.
unsafe impl Send for ArenaMemory {}
unsafe impl Sync for ArenaMemory {}

impl ArenaMemory {
    /// Backend handle.
    #[must_use]
    pub fn handle(&self) -> MemoryHandle {
        self.handle
    }

    /// Block size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Backend memory type id.
    #[must_use]
    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }

    /// True when the block exposes a CPU-visible mapping.
    #[must_use]
    pub fn is_host_visible(&self) -> bool {
        self.mapped.is_some()
    }

    pub(crate) fn mapped(&self) -> Option<NonNull<u8>> {
        self.mapped
    }
}

impl Drop for ArenaMemory {
    fn drop(&mut self) {
        self.backend.free_memory(self.handle);
    }
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

struct BufferBinding {
    offset: u64,
    mapped: Option<NonNull<u8>>,
}

/// An owned buffer, created unbound and bound once into a memory
/// block.
pub struct ArenaBuffer {
    handle: BufferHandle,
    usage: BufferUsage,
    size: u64,
    alignment: u64,
    memory_type: u32,
    binding: Option<BufferBinding>,
    backend: Arc<dyn DeviceBackend>,
    sink: Arc<ErrorSink>,
}

// SAFETY: see ArenaMemory; the binding's mapped pointer is only read
// through disjoint slices.
unsafe impl Send for ArenaBuffer {}
unsafe impl Sync for ArenaBuffer {}

impl ArenaBuffer {
    /// Backend handle.
    #[must_use]
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Usage tag the buffer was created for.
    #[must_use]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Buffer size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Placement alignment required within a memory block.
    #[must_use]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Memory type the buffer must be bound into.
    #[must_use]
    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }

    /// True once bound into a memory block.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// Bind the buffer into `memory` at `offset`.
    ///
    /// # Errors
    /// Fatal on double bind, memory-type mismatch, or a range past the
    /// end of the block: all indicate a sizing-algorithm bug.
    pub fn bind(&mut self, memory: &ArenaMemory, offset: u64) -> Result<(), ArenaError> {
        if self.binding.is_some() {
            return Err(self.sink.fatal(ArenaError::Backend(BackendError::AlreadyBound)));
        }
        if self.memory_type != memory.memory_type() {
            return Err(self.sink.fatal(ArenaError::MemoryTypeMismatch {
                expected: self.memory_type,
                actual: memory.memory_type(),
            }));
        }
        if offset + self.size > memory.size() {
            return Err(self.sink.fatal(ArenaError::RangeOverflow {
                needed: offset + self.size,
                available: memory.size(),
            }));
        }
        if let Err(e) = self.backend.bind_buffer(self.handle, memory.handle(), offset) {
            return Err(self.sink.fatal(e.into()));
        }
        let mapped = memory.mapped().map(|base| {
            // SAFETY: offset + size fits in the block (checked above),
            // so the derived pointer stays inside the same allocation.
            unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) }
        });
        self.binding = Some(BufferBinding { offset, mapped });
        Ok(())
    }

    /// Offset of this buffer within its memory block.
    #[must_use]
    pub fn bind_offset(&self) -> Option<u64> {
        self.binding.as_ref().map(|b| b.offset)
    }

    /// Bounds-checked sub-range of the bound buffer.
    ///
    /// # Errors
    /// Fatal if the buffer is unbound or the range exceeds its size.
    pub fn slice(&self, from: u64, size: u64) -> Result<BufferSlice, ArenaError> {
        let Some(binding) = self.binding.as_ref() else {
            return Err(self.sink.fatal(ArenaError::NotBound));
        };
        if from + size > self.size {
            return Err(self.sink.fatal(ArenaError::RangeOverflow {
                needed: from + size,
                available: self.size,
            }));
        }
        let mapped = binding.mapped.map(|base| {
            // SAFETY: from + size fits in the buffer, which fits in the
            // block.
            unsafe { NonNull::new_unchecked(base.as_ptr().add(from as usize)) }
        });
        Ok(BufferSlice {
            buffer: self.handle,
            offset: from,
            len: size,
            mapped,
        })
    }
}

impl Drop for ArenaBuffer {
    fn drop(&mut self) {
        self.backend.destroy_buffer(self.handle);
    }
}

// ---------------------------------------------------------------------------
// Buffer slices
// ---------------------------------------------------------------------------

/// A byte range of a committed backing buffer, handed out by
/// `alloc_slice`.
///
/// For host-visible memory the slice carries a pointer into the
/// block's persistent mapping; writes go straight to the bytes the GPU
/// will read. Distinct slices never overlap, so producer threads may
/// write their own slices concurrently.
///
/// Validity follows the ring contract: the bytes stay valid until the
/// owning frame instance's *next* `begin_frame` cleanup. Do not hold a
/// slice across that boundary.
#[derive(Debug, Clone, Copy)]
pub struct BufferSlice {
    buffer: BufferHandle,
    offset: u64,
    len: u64,
    mapped: Option<NonNull<u8>>,
}

// SAFETY: concurrent use is raw-pointer writes/reads to disjoint
// ranges; the pointer itself is plain data.
unsafe impl Send for BufferSlice {}
unsafe impl Sync for BufferSlice {}

impl BufferSlice {
    /// Backing buffer handle (for draw/dispatch recording).
    #[must_use]
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Byte offset within the backing buffer.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True for zero-length slices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when the slice is CPU-writable (host-visible memory).
    #[must_use]
    pub fn is_host_visible(&self) -> bool {
        self.mapped.is_some()
    }

    /// Copy `data` to the start of the slice.
    ///
    /// # Errors
    /// [`ArenaError::HostAccessToDeviceMemory`] on device-local slices;
    /// [`ArenaError::RangeOverflow`] when `data` is longer than the
    /// slice.
    pub fn write_bytes(&self, data: &[u8]) -> Result<(), ArenaError> {
        let Some(base) = self.mapped else {
            return Err(ArenaError::HostAccessToDeviceMemory);
        };
        if data.len() as u64 > self.len {
            return Err(ArenaError::RangeOverflow {
                needed: data.len() as u64,
                available: self.len,
            });
        }
        // SAFETY: range checked; no other slice covers these bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.as_ptr(), data.len());
        }
        Ok(())
    }

    /// Copy a `Pod` slice to the start of the slice.
    ///
    /// # Errors
    /// Same conditions as [`BufferSlice::write_bytes`].
    pub fn write_pod<T: bytemuck::Pod>(&self, data: &[T]) -> Result<(), ArenaError> {
        self.write_bytes(bytemuck::cast_slice(data))
    }

    /// View the slice's bytes (host-visible memory only).
    ///
    /// The returned slice is valid until the owning frame instance's
    /// next `begin_frame`; holding it past that point reads reclaimed
    /// memory.
    ///
    /// # Errors
    /// [`ArenaError::HostAccessToDeviceMemory`] on device-local slices.
    pub fn bytes(&self) -> Result<&[u8], ArenaError> {
        let Some(base) = self.mapped else {
            return Err(ArenaError::HostAccessToDeviceMemory);
        };
        // SAFETY: the mapping covers [offset, offset + len) of a live
        // block for the current ring cycle.
        Ok(unsafe { std::slice::from_raw_parts(base.as_ptr(), self.len as usize) })
    }
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// An owned image, created unbound and bound once into a memory block.
pub struct ArenaImage {
    handle: ImageHandle,
    usage: ImageUsage,
    desc: ImageDescription,
    size: u64,
    alignment: u64,
    memory_type: u32,
    bound: bool,
    backend: Arc<dyn DeviceBackend>,
    sink: Arc<ErrorSink>,
}

impl ArenaImage {
    /// Backend handle.
    #[must_use]
    pub fn handle(&self) -> ImageHandle {
        self.handle
    }

    /// Usage bits the image was created with.
    #[must_use]
    pub fn usage(&self) -> ImageUsage {
        self.usage
    }

    /// Creation description.
    #[must_use]
    pub fn description(&self) -> ImageDescription {
        self.desc
    }

    /// Image size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Placement alignment required within a memory block.
    #[must_use]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Memory type the image must be bound into.
    #[must_use]
    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }

    /// True once bound into a memory block.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Bind the image into `memory` at `offset`.
    ///
    /// # Errors
    /// Fatal on double bind, memory-type mismatch, or range overflow.
    pub fn bind(&mut self, memory: &ArenaMemory, offset: u64) -> Result<(), ArenaError> {
        if self.bound {
            return Err(self.sink.fatal(ArenaError::Backend(BackendError::AlreadyBound)));
        }
        if self.memory_type != memory.memory_type() {
            return Err(self.sink.fatal(ArenaError::MemoryTypeMismatch {
                expected: self.memory_type,
                actual: memory.memory_type(),
            }));
        }
        if offset + self.size > memory.size() {
            return Err(self.sink.fatal(ArenaError::RangeOverflow {
                needed: offset + self.size,
                available: memory.size(),
            }));
        }
        if let Err(e) = self.backend.bind_image(self.handle, memory.handle(), offset) {
            return Err(self.sink.fatal(e.into()));
        }
        self.bound = true;
        Ok(())
    }

    /// Create a view over the bound image.
    ///
    /// # Errors
    /// Fatal if the image is unbound or the backend rejects the range.
    pub fn create_view(&self, range: &ImageRange) -> Result<ArenaImageView, ArenaError> {
        if !self.bound {
            return Err(self.sink.fatal(ArenaError::NotBound));
        }
        match self.backend.create_image_view(self.handle, range) {
            Ok(handle) => Ok(ArenaImageView {
                handle,
                range: *range,
                backend: Arc::clone(&self.backend),
            }),
            Err(e) => Err(self.sink.fatal(e.into())),
        }
    }
}

impl Drop for ArenaImage {
    fn drop(&mut self) {
        self.backend.destroy_image(self.handle);
    }
}

/// An owned view over an [`ArenaImage`].
pub struct ArenaImageView {
    handle: ImageViewHandle,
    range: ImageRange,
    backend: Arc<dyn DeviceBackend>,
}

impl ArenaImageView {
    /// Backend handle.
    #[must_use]
    pub fn handle(&self) -> ImageViewHandle {
        self.handle
    }

    /// Sub-resource range the view covers.
    #[must_use]
    pub fn range(&self) -> ImageRange {
        self.range
    }
}

impl Drop for ArenaImageView {
    fn drop(&mut self) {
        self.backend.destroy_image_view(self.handle);
    }
}
