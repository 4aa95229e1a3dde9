//! GPU memory allocation.
//!
//! This module provides the [`Allocator`] type, a wrapper around the Vulkan
//! Memory Allocator (VMA) library. Index storage, scratch buffers, instance
//! input buffers and binding table buffers are all allocated through it.
//!
//! Create an allocator once per device and pass it to buffer creation
//! functions. Allocation failures surface as
//! [`Error::ResourceExhaustion`](crate::Error::ResourceExhaustion); the build
//! engine never retries them.

use std::{ops::Deref, sync::Arc};

use crate::{
    error::{Error, Result},
    Device, HasDevice,
};

/// A GPU memory allocator using the Vulkan Memory Allocator (VMA) library.
///
/// Reference-counted wrapper; thread-safe and cheap to clone. Buffer device
/// address support is always enabled because every buffer this crate creates
/// is referenced by device address from build commands or dispatch regions.
#[derive(Clone)]
pub struct Allocator(Arc<AllocatorInner>);
struct AllocatorInner {
    // Declared before `device` so VMA is torn down while the device is alive.
    inner: vk_mem::Allocator,
    device: Device,
}

impl HasDevice for Allocator {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl Allocator {
    pub fn new(device: Device) -> Result<Self> {
        let mut info = vk_mem::AllocatorCreateInfo::new(
            device.instance(),
            &device,
            device.physical_device(),
        );
        info.flags |= vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;
        let alloc =
            unsafe { vk_mem::Allocator::new(info) }.map_err(Error::allocation("VMA allocator"))?;
        Ok(Self(Arc::new(AllocatorInner {
            inner: alloc,
            device,
        })))
    }
}

impl Deref for Allocator {
    type Target = vk_mem::Allocator;

    fn deref(&self) -> &Self::Target {
        &self.0.inner
    }
}
