//! Opaque device backend contract.
//!
//! The arena never talks to a graphics API directly: every memory,
//! buffer, image, and descriptor-pool operation goes through the
//! [`DeviceBackend`] trait, injected at [`crate::frame::FrameCache`]
//! construction. Real device layers (Vulkan, wgpu, ...) live outside
//! this crate; the in-tree [`headless::HeadlessBackend`] is a fully
//! validating stand-in for tests and headless tools.

use std::fmt;
use std::ptr::NonNull;

use crate::descriptor::DescriptorLayout;

pub mod headless;

pub use headless::HeadlessBackend;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Backend handle to a device memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryHandle(pub u64);

/// Backend handle to an unbound or bound buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Backend handle to an image object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub u64);

/// Backend handle to an image view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageViewHandle(pub u64);

/// Backend handle to a descriptor pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorPoolHandle(pub u64);

/// Backend handle to a descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetHandle(pub u64);

// ---------------------------------------------------------------------------
// Usage tags and image metadata
// ---------------------------------------------------------------------------

/// Intent tag for a transient buffer class.
///
/// Each tag keys one independently-sized scratch slice per frame
/// instance; the backend reports a fixed alignment per tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Vertex scratch.
    Vertex,
    /// Index scratch.
    Index,
    /// Uniform scratch.
    Uniform,
    /// Storage scratch.
    Storage,
    /// Indirect-argument scratch.
    Indirect,
    /// Staging uploads (CPU to GPU).
    TransferSrc,
    /// Readback targets (GPU to CPU).
    TransferDst,
}

/// Image usage bits, combinable with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageUsage(pub u32);

impl ImageUsage {
    /// Sampled in a shader.
    pub const SAMPLED: Self = Self(1);
    /// Color render target.
    pub const COLOR_ATTACHMENT: Self = Self(1 << 1);
    /// Depth/stencil render target.
    pub const DEPTH_ATTACHMENT: Self = Self(1 << 2);
    /// Transfer source.
    pub const TRANSFER_SRC: Self = Self(1 << 3);
    /// Transfer destination.
    pub const TRANSFER_DST: Self = Self(1 << 4);
    /// Storage image access.
    pub const STORAGE: Self = Self(1 << 5);

    /// True when every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ImageUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Pixel format of a transient image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// 8-bit RGBA, unsigned normalized.
    R8g8b8a8Unorm,
    /// 8-bit BGRA, unsigned normalized.
    B8g8r8a8Unorm,
    /// 16-bit float RGBA.
    R16g16b16a16Sfloat,
    /// Single-channel 32-bit float.
    R32Sfloat,
    /// 32-bit float depth.
    D32Sfloat,
}

impl ImageFormat {
    /// Bytes per pixel.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> u64 {
        match self {
            Self::R8g8b8a8Unorm | Self::B8g8r8a8Unorm | Self::R32Sfloat | Self::D32Sfloat => 4,
            Self::R16g16b16a16Sfloat => 8,
        }
    }
}

/// Shape of a transient image reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDescription {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Depth in pixels (1 for 2D images).
    pub depth: u32,
    /// Pixel format.
    pub format: ImageFormat,
    /// Array layer count (6 for a cube).
    pub layers: u32,
    /// Mip level count.
    pub mip_levels: u32,
}

impl ImageDescription {
    /// 2D single-layer, single-mip description.
    #[must_use]
    pub const fn d2(width: u32, height: u32, format: ImageFormat) -> Self {
        Self {
            width,
            height,
            depth: 1,
            format,
            layers: 1,
            mip_levels: 1,
        }
    }

    /// Range covering every layer and mip level.
    #[must_use]
    pub const fn full_range(&self) -> ImageRange {
        ImageRange {
            first_mip_level: 0,
            level_count: self.mip_levels,
            first_layer: 0,
            layer_count: self.layers,
        }
    }
}

/// Sub-resource range for an image view (mips and layers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageRange {
    /// First mip level covered by the view.
    pub first_mip_level: u32,
    /// Number of mip levels.
    pub level_count: u32,
    /// First array layer covered by the view.
    pub first_layer: u32,
    /// Number of array layers.
    pub layer_count: u32,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures reported by the device backend. Every variant is fatal for
/// the arena: there is no retry or graceful degradation mid-frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
    /// The device rejected an allocation request.
    OutOfMemory {
        /// Bytes requested.
        requested: u64,
    },
    /// A handle did not refer to a live backend object.
    InvalidHandle,
    /// Bind target object is already bound to memory.
    AlreadyBound,
    /// Buffer/image memory type does not match the target block.
    MemoryTypeMismatch {
        /// Memory type required by the resource.
        expected: u32,
        /// Memory type of the block offered.
        actual: u32,
    },
    /// A bind range exceeds the target memory block.
    RangeOverflow {
        /// End of the requested range.
        needed: u64,
        /// Size of the block.
        available: u64,
    },
    /// A bind offset violates the resource's alignment requirement.
    MisalignedOffset {
        /// Offered offset.
        offset: u64,
        /// Required alignment.
        alignment: u64,
    },
    /// Descriptor pool has no free set left.
    PoolExhausted {
        /// Pool capacity.
        capacity: u32,
    },
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "device out of memory (requested {requested} bytes)")
            }
            Self::InvalidHandle => write!(f, "stale or unknown backend handle"),
            Self::AlreadyBound => write!(f, "object is already bound to memory"),
            Self::MemoryTypeMismatch { expected, actual } => {
                write!(f, "memory type should be {expected}, not {actual}")
            }
            Self::RangeOverflow { needed, available } => {
                write!(f, "required size {needed}, available {available}")
            }
            Self::MisalignedOffset { offset, alignment } => {
                write!(f, "offset {offset} violates alignment {alignment}")
            }
            Self::PoolExhausted { capacity } => {
                write!(f, "descriptor pool exhausted (capacity {capacity})")
            }
        }
    }
}

impl std::error::Error for BackendError {}

// ---------------------------------------------------------------------------
// Allocation results
// ---------------------------------------------------------------------------

/// A freshly allocated memory block.
pub struct MemoryAllocation {
    /// Handle to the block.
    pub handle: MemoryHandle,
    /// Persistently-mapped base pointer for host-visible memory;
    /// `None` for device-local blocks.
    pub mapped: Option<NonNull<u8>>,
}

/// Metadata for a created (still unbound) buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferRequirements {
    /// Handle to the buffer.
    pub handle: BufferHandle,
    /// Buffer size in bytes.
    pub size: u64,
    /// Required placement alignment within a memory block.
    pub alignment: u64,
    /// Memory type the buffer must be bound into.
    pub memory_type: u32,
}

/// Metadata for a created (still unbound) image.
#[derive(Debug, Clone, Copy)]
pub struct ImageRequirements {
    /// Handle to the image.
    pub handle: ImageHandle,
    /// Image size in bytes.
    pub size: u64,
    /// Required placement alignment within a memory block.
    pub alignment: u64,
    /// Memory type the image must be bound into.
    pub memory_type: u32,
}

// ---------------------------------------------------------------------------
// The contract
// ---------------------------------------------------------------------------

/// Device-layer primitives the arena is built on.
///
/// Implementations must report allocation failure as an error rather
/// than aborting, must keep host-visible mappings stable for the life
/// of the block, and must tolerate destroy calls on handles they have
/// already invalidated. No method may assume it is called from one
/// particular thread.
pub trait DeviceBackend: Send + Sync {
    /// Allocate a typed memory block. Host-visible blocks come back
    /// persistently mapped.
    ///
    /// # Errors
    /// [`BackendError::OutOfMemory`] when the device cannot satisfy the
    /// request.
    fn alloc_memory(
        &self,
        size: u64,
        memory_type: u32,
        host_visible: bool,
    ) -> Result<MemoryAllocation, BackendError>;

    /// Release a memory block. The mapping (if any) dies with it.
    fn free_memory(&self, memory: MemoryHandle);

    /// Create an unbound buffer and report its placement requirements.
    ///
    /// # Errors
    /// [`BackendError::OutOfMemory`] when the device cannot create the
    /// buffer object.
    fn create_buffer(
        &self,
        usage: BufferUsage,
        size: u64,
        host_visible: bool,
    ) -> Result<BufferRequirements, BackendError>;

    /// Destroy a buffer.
    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Bind a buffer into a memory block at `offset`.
    ///
    /// # Errors
    /// Invalid handles, double binds, memory-type mismatches, and
    /// misaligned or out-of-range placements are rejected.
    fn bind_buffer(
        &self,
        buffer: BufferHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> Result<(), BackendError>;

    /// Create an unbound image and report its placement requirements.
    ///
    /// # Errors
    /// [`BackendError::OutOfMemory`] when the device cannot create the
    /// image object.
    fn create_image(
        &self,
        usage: ImageUsage,
        desc: &ImageDescription,
    ) -> Result<ImageRequirements, BackendError>;

    /// Destroy an image.
    fn destroy_image(&self, image: ImageHandle);

    /// Bind an image into a memory block at `offset`.
    ///
    /// # Errors
    /// Same rejection rules as [`DeviceBackend::bind_buffer`].
    fn bind_image(
        &self,
        image: ImageHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> Result<(), BackendError>;

    /// Create a view over a bound image.
    ///
    /// # Errors
    /// [`BackendError::InvalidHandle`] for an unknown or still-unbound
    /// image.
    fn create_image_view(
        &self,
        image: ImageHandle,
        range: &ImageRange,
    ) -> Result<ImageViewHandle, BackendError>;

    /// Destroy an image view.
    fn destroy_image_view(&self, view: ImageViewHandle);

    /// Create a descriptor pool able to hold `capacity` sets of the
    /// given layout.
    ///
    /// # Errors
    /// [`BackendError::OutOfMemory`] when the pool cannot be created.
    fn create_descriptor_pool(
        &self,
        layout: &DescriptorLayout,
        capacity: u32,
    ) -> Result<DescriptorPoolHandle, BackendError>;

    /// Destroy a descriptor pool and every set allocated from it.
    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle);

    /// Allocate one descriptor set from a pool.
    ///
    /// # Errors
    /// [`BackendError::PoolExhausted`] once `capacity` sets are live,
    /// [`BackendError::InvalidHandle`] for an unknown pool.
    fn alloc_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
    ) -> Result<DescriptorSetHandle, BackendError>;
}
