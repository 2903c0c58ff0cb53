//! Frame-pipelined GPU resource arena for N frames in flight.
//!
//! A renderer keeping several frames in flight rebuilds roughly the
//! same set of transient resources every frame: uniform and vertex
//! scratch, descriptor sets, render-target images. Allocating them
//! through the driver each frame is wasteful; freeing them while the
//! GPU may still read them is unsound. This crate amortizes both with
//! a reserve/commit/allocate protocol over a fixed ring of frame
//! instances.
//!
//! # Key entry points
//!
//! - [`frame::FrameCache`] - the arena: allocator, shared cache, and
//!   the frame ring
//! - [`frame::FrameInstance`] - one ring slot and its phase cycle
//!   (`begin_frame` → `reserve_*` → `commit` → `alloc_*` → `freeze`)
//! - [`backend::DeviceBackend`] - the trait a graphics API implements
//!   to sit underneath the arena ([`backend::HeadlessBackend`] is the
//!   in-process implementation used by the test suite)
//! - [`cache::Key`] - process-unique identity for cached values and
//!   transient images
//!
//! # Architecture
//!
//! Per frame, producer threads first *reserve* (declare byte and set
//! counts; cheap, spinlock-protected counter bumps), the orchestrator
//! then *commits* (backing buffers, images, memory blocks, and
//! descriptor pools grow monotonically to the demand high-water mark),
//! and producers *allocate* concrete slices, sets, and image handles
//! out of the committed capacity. A warmed-up arena runs frame after
//! frame without touching the backend at all. Frozen resources stay
//! untouched until the same instance's next `begin_frame`, giving the
//! GPU N-1 frames to finish reading them.

pub mod allocator;
pub mod backend;
pub mod cache;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod spinlock;
