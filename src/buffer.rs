//! Vulkan buffer abstractions with automatic memory management.
//!
//! Two allocation strategies cover everything the build engine and the binding
//! table generator need:
//!
//! - **[`Buffer::new_private`]**: GPU-exclusive memory. Used for index storage
//!   and build scratch.
//! - **[`Buffer::new_upload`]**: device-local, host-visible, persistently
//!   mapped. Used for instance input and the binding table buffer, both of
//!   which are written through [`Buffer::as_slice_mut`].
//!
//! The caller-facing geometry descriptors in this crate never hold [`Buffer`]
//! references: build inputs are passed as raw device addresses, and the caller
//! keeps the source buffers alive for the lifetime of the built index.

use std::fmt::Debug;

use ash::vk;
use vk_mem::Alloc;

use crate::{
    error::{Error, Result},
    utils::AsVkHandle,
    Allocator, Device, HasDevice,
};

/// Common interface for Vulkan buffer types.
pub trait BufferLike: AsVkHandle<Handle = vk::Buffer> {
    /// Offset within the underlying `vkBuffer`. Always 0 for standalone
    /// buffers; nonzero for suballocations.
    fn offset(&self) -> vk::DeviceSize;

    /// Buffer device address, or 0 if the buffer was not created with
    /// `SHADER_DEVICE_ADDRESS` usage.
    fn device_address(&self) -> vk::DeviceAddress;

    fn size(&self) -> vk::DeviceSize;
}

/// A buffer fully bound to a VMA allocation.
pub struct Buffer {
    allocator: Allocator,
    allocation: vk_mem::Allocation,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    device_address: vk::DeviceAddress,
    mapped: *mut u8,
}
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl HasDevice for Buffer {
    fn device(&self) -> &Device {
        self.allocator.device()
    }
}
impl Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size)
            .field("device_address", &self.device_address)
            .finish_non_exhaustive()
    }
}
impl AsVkHandle for Buffer {
    type Handle = vk::Buffer;
    fn vk_handle(&self) -> Self::Handle {
        self.buffer
    }
}
impl BufferLike for Buffer {
    fn offset(&self) -> vk::DeviceSize {
        0
    }

    fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.allocator
                .destroy_buffer(self.buffer, &mut self.allocation);
        }
    }
}

impl Buffer {
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    fn from_raw(
        allocator: Allocator,
        buffer: vk::Buffer,
        allocation: vk_mem::Allocation,
        usage: vk::BufferUsageFlags,
        size: vk::DeviceSize,
    ) -> Self {
        let info = allocator.get_allocation_info(&allocation);
        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            unsafe {
                allocator
                    .device()
                    .get_buffer_device_address(&vk::BufferDeviceAddressInfo {
                        buffer,
                        ..Default::default()
                    })
            }
        } else {
            0
        };

        Self {
            allocator,
            buffer,
            allocation,
            size,
            device_address,
            mapped: info.mapped_data as *mut u8,
        }
    }

    /// Creates a buffer accessible exclusively from the GPU.
    ///
    /// Use for index storage and scratch memory.
    pub fn new_private(
        allocator: Allocator,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        what: &'static str,
    ) -> Result<Self> {
        let (buffer, allocation) = unsafe {
            allocator.create_buffer_with_alignment(
                &vk::BufferCreateInfo {
                    size,
                    usage,
                    ..Default::default()
                },
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::AutoPreferDevice,
                    ..Default::default()
                },
                alignment,
            )
        }
        .map_err(Error::allocation(what))?;
        Ok(Self::from_raw(allocator, buffer, allocation, usage, size))
    }

    /// Creates a device-local, host-visible, persistently mapped buffer.
    ///
    /// Use for data written by the host and read by build commands or the ray
    /// dispatch: instance input and the shader binding table.
    pub fn new_upload(
        allocator: Allocator,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        what: &'static str,
    ) -> Result<Self> {
        let (buffer, allocation) = unsafe {
            allocator.create_buffer_with_alignment(
                &vk::BufferCreateInfo {
                    size,
                    usage,
                    ..Default::default()
                },
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::AutoPreferDevice,
                    flags: vk_mem::AllocationCreateFlags::MAPPED
                        | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                    ..Default::default()
                },
                alignment,
            )
        }
        .map_err(Error::allocation(what))?;
        Ok(Self::from_raw(allocator, buffer, allocation, usage, size))
    }

    /// Mutable view of the mapped memory. `None` for private buffers.
    pub fn as_slice_mut(&mut self) -> Option<&mut [u8]> {
        if self.mapped.is_null() {
            None
        } else {
            Some(unsafe { std::slice::from_raw_parts_mut(self.mapped, self.size as usize) })
        }
    }
}
