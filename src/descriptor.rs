//! Descriptor layouts, pools, and sets.
//!
//! Only the arena-facing surface of the descriptor system lives here:
//! layouts give descriptor classes their identity, pools are the
//! backing objects the frame layer grows, and sets are the opaque
//! handles producers bind with. Writing resources into a set is the
//! device layer's business.

use std::sync::Arc;

use crate::backend::{DescriptorPoolHandle, DescriptorSetHandle, DeviceBackend};
use crate::cache::Key;
use crate::error::ArenaError;

/// What one binding of a layout holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorType {
    /// Uniform buffer binding.
    UniformBuffer,
    /// Storage buffer binding.
    StorageBuffer,
    /// Combined image + sampler binding.
    CombinedImageSampler,
    /// Storage image binding.
    StorageImage,
}

/// One binding slot of a descriptor layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    /// Kind of resource bound at this slot.
    pub descriptor_type: DescriptorType,
    /// Array size of the slot.
    pub count: u32,
}

/// An immutable descriptor-set layout.
///
/// Identity, not structure, keys the arena's descriptor classes: two
/// layouts with identical bindings are still distinct classes. Share
/// one `Arc<DescriptorLayout>` device-wide for resources that should
/// pool together.
#[derive(Debug)]
pub struct DescriptorLayout {
    key: Key,
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorLayout {
    /// New layout with a fresh identity.
    #[must_use]
    pub fn new(bindings: Vec<DescriptorBinding>) -> Arc<Self> {
        Arc::new(Self {
            key: Key::new(),
            bindings,
        })
    }

    /// Identity key (the arena's descriptor-class map key).
    #[must_use]
    pub fn key(&self) -> Key {
        self.key
    }

    /// Binding slots of the layout.
    #[must_use]
    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }
}

/// An owned descriptor pool sized to a fixed capacity.
pub struct DescriptorPool {
    handle: DescriptorPoolHandle,
    capacity: u32,
    layout: Arc<DescriptorLayout>,
    backend: Arc<dyn DeviceBackend>,
}

impl DescriptorPool {
    /// Create a pool able to hold `capacity` sets of `layout`.
    ///
    /// # Errors
    /// Propagates backend failure (fatal for the arena).
    pub fn new(
        backend: &Arc<dyn DeviceBackend>,
        layout: &Arc<DescriptorLayout>,
        capacity: u32,
    ) -> Result<Self, ArenaError> {
        let handle = backend.create_descriptor_pool(layout, capacity)?;
        Ok(Self {
            handle,
            capacity,
            layout: Arc::clone(layout),
            backend: Arc::clone(backend),
        })
    }

    /// Backend handle.
    #[must_use]
    pub fn handle(&self) -> DescriptorPoolHandle {
        self.handle
    }

    /// Number of sets the pool can hold.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Layout the pool was created for.
    #[must_use]
    pub fn layout(&self) -> &Arc<DescriptorLayout> {
        &self.layout
    }

    /// Allocate one set from the pool.
    ///
    /// # Errors
    /// Propagates backend failure, including pool exhaustion.
    pub fn alloc_set(&self) -> Result<DescriptorSet, ArenaError> {
        let handle = self.backend.alloc_descriptor_set(self.handle)?;
        Ok(DescriptorSet { handle })
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.backend.destroy_descriptor_pool(self.handle);
    }
}

/// An opaque descriptor-set handle, reusable across frames while its
/// pool lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSet {
    handle: DescriptorSetHandle,
}

impl DescriptorSet {
    /// Backend handle.
    #[must_use]
    pub fn handle(&self) -> DescriptorSetHandle {
        self.handle
    }
}
