//! One-shot command recording and submission.
//!
//! Acceleration structure construction is phased: record a batch, submit it,
//! block on a fence, then reclaim scratch or read queries back. Every
//! suspension point in this crate is such a blocking host wait, so the command
//! layer reduces to a pool owning a single reusable one-time-submit command
//! buffer and a fence.
//!
//! The pool is exclusively owned by one builder; batches are strictly
//! sequential and never run concurrently with each other.

use ash::vk;

use crate::{error::Result, utils::AsVkHandle, Device};

/// A command pool driving one-shot submissions on a single queue family.
pub struct CommandPool {
    device: Device,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

impl CommandPool {
    pub fn new(device: Device, queue_family_index: u32) -> Result<Self> {
        unsafe {
            let pool = device.create_command_pool(
                &vk::CommandPoolCreateInfo {
                    queue_family_index,
                    ..Default::default()
                },
                None,
            )?;
            let buffer = match device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo {
                    command_pool: pool,
                    level: vk::CommandBufferLevel::PRIMARY,
                    command_buffer_count: 1,
                    ..Default::default()
                },
            ) {
                Ok(buffers) => buffers[0],
                Err(err) => {
                    device.destroy_command_pool(pool, None);
                    return Err(err.into());
                }
            };
            let fence = match device.create_fence(&vk::FenceCreateInfo::default(), None) {
                Ok(fence) => fence,
                Err(err) => {
                    device.destroy_command_pool(pool, None);
                    return Err(err.into());
                }
            };
            Ok(Self {
                device,
                pool,
                buffer,
                fence,
            })
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Records commands into the pool's command buffer, submits them on
    /// `queue`, and blocks until the fence signals.
    ///
    /// On return, everything the recorded commands produced is visible to the
    /// host and any transient resources they read may be reclaimed.
    pub fn submit_and_wait<R>(
        &mut self,
        queue: vk::Queue,
        record: impl FnOnce(&Device, vk::CommandBuffer) -> Result<R>,
    ) -> Result<R> {
        unsafe {
            self.device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
            self.device.begin_command_buffer(
                self.buffer,
                &vk::CommandBufferBeginInfo {
                    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    ..Default::default()
                },
            )?;
            let out = record(&self.device, self.buffer)?;
            self.device.end_command_buffer(self.buffer)?;

            let buffers = [self.buffer];
            let submit = vk::SubmitInfo::default().command_buffers(&buffers);
            self.device.queue_submit(queue, &[submit], self.fence)?;
            self.device.wait_for_fences(&[self.fence], true, u64::MAX)?;
            self.device.reset_fences(&[self.fence])?;
            Ok(out)
        }
    }
}

impl AsVkHandle for CommandPool {
    type Handle = vk::CommandPool;
    fn vk_handle(&self) -> Self::Handle {
        self.pool
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// Orders acceleration structure writes against later reads in the same
/// command stream: build before compacted-size query, build before copy,
/// bottom-level build before the top-level build that references it.
pub fn accel_build_barrier(device: &Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier2 {
        src_stage_mask: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        src_access_mask: vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        dst_stage_mask: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
            | vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_COPY_KHR,
        dst_access_mask: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
        ..Default::default()
    };
    let barriers = [barrier];
    let dependency = vk::DependencyInfo::default().memory_barriers(&barriers);
    unsafe {
        device.cmd_pipeline_barrier2(cmd, &dependency);
    }
}
