//! Vulkan acceleration structure building and shader binding table layout.
//!
//! Two engines, both driving `VK_KHR_acceleration_structure` and
//! `VK_KHR_ray_tracing_pipeline` through [ash](https://docs.rs/ash):
//!
//! - [`BlasBuilder`] and [`TlasBuilder`] turn geometry and instance
//!   descriptors into built acceleration structures, batching bottom-level
//!   builds under a caller-set scratch budget and supporting compaction and
//!   in-place updates.
//! - [`SbtBuilder`] computes shader binding table layouts from pipeline
//!   properties and writes the table bytes.
//!
//! The application owns instance and device creation, queue selection and the
//! ray tracing pipeline itself; wrap the device with [`Device::new`] and an
//! [`Allocator`] and everything else flows from there. All device work is
//! submitted and fenced synchronously, so every builder call returns with its
//! GPU work complete.

mod accel;
mod alloc;
mod buffer;
mod build;
mod command;
mod device;
mod error;
mod geometry;
mod sbt;
mod utils;

pub use accel::{AccelStruct, BlasId, BlasSet, BuildSizing};
pub use alloc::Allocator;
pub use buffer::{Buffer, BufferLike};
pub use build::{
    BlasBuilder, BuildStatus, CompactionCandidate, CompactionStats, TlasBuilder,
};
pub use command::CommandPool;
pub use device::{
    AccelerationStructureProperties, Device, HasDevice, RayTracingPipelineProperties,
};
pub use error::{Error, Result};
pub use geometry::{AabbGeometry, BlasGeometry, InstanceDesc, TriangleGeometry};
pub use sbt::{GroupKind, SbtBuilder, SbtHandles, SbtRegions, ShaderBindingTable};
pub use utils::AsVkHandle;

pub use ash;
pub use vk_mem;

pub mod prelude {
    pub use crate::{
        utils::AsVkHandle, Allocator, BlasBuilder, BlasGeometry, BlasId, BufferLike, Device,
        HasDevice, InstanceDesc, SbtBuilder, TlasBuilder,
    };
    pub use ash::vk;
}
