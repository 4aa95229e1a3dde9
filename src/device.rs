//! Logical device wrapper.
//!
//! This crate does not create instances or negotiate queues; the application
//! layer owns that. [`Device`] wraps an already-created `ash::Device` together
//! with the two extension function tables this crate records commands through
//! (`VK_KHR_acceleration_structure`, `VK_KHR_ray_tracing_pipeline`) and a
//! snapshot of the physical-device properties the build and layout arithmetic
//! depends on.
//!
//! The wrapper takes ownership: the underlying `vkDevice` is destroyed when
//! the last clone drops.

use std::{fmt::Debug, ops::Deref, sync::Arc};

use ash::{khr, vk};

use crate::utils::AsVkHandle;

/// A trait for types created from a Vulkan device.
pub trait HasDevice {
    fn device(&self) -> &Device;
}

/// Properties of `VK_KHR_acceleration_structure` consumed by the build engine.
#[derive(Clone, Copy, Debug)]
pub struct AccelerationStructureProperties {
    /// Required offset alignment for scratch suballocations within a batch.
    pub min_scratch_offset_alignment: u32,
    /// Maximum number of instances a top-level structure may reference.
    pub max_instance_count: u64,
}

/// Properties of `VK_KHR_ray_tracing_pipeline` consumed by the binding table
/// layout arithmetic. Plain data so the layout math can run without a device.
#[derive(Clone, Copy, Debug)]
pub struct RayTracingPipelineProperties {
    /// Size of one opaque shader group handle in bytes.
    pub handle_size: u32,
    /// Alignment of each entry within a binding table region.
    pub handle_alignment: u32,
    /// Alignment of each region's start address.
    pub base_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

/// A Vulkan logical device wrapper, reference-counted for cheap sharing.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);
impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Device {}
impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Device")
            .field(&self.0.device.handle())
            .finish()
    }
}

struct DeviceInner {
    instance: ash::Instance,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    accel_fns: khr::acceleration_structure::Device,
    rt_pipeline_fns: khr::ray_tracing_pipeline::Device,
    accel_properties: AccelerationStructureProperties,
    rt_pipeline_properties: RayTracingPipelineProperties,
}

impl Device {
    /// Wraps an application-created logical device.
    ///
    /// The device must have been created with `VK_KHR_acceleration_structure`
    /// and `VK_KHR_ray_tracing_pipeline` enabled (plus their feature structs),
    /// `bufferDeviceAddress`, and Vulkan 1.3 or `VK_KHR_synchronization2`.
    ///
    /// # Safety
    ///
    /// `device` must be a valid logical device created from `physical_device`
    /// on `instance`, and ownership transfers to the returned wrapper: the
    /// caller must not destroy it.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Self {
        let accel_fns = khr::acceleration_structure::Device::new(instance, &device);
        let rt_pipeline_fns = khr::ray_tracing_pipeline::Device::new(instance, &device);

        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut accel_props)
            .push_next(&mut rt_props);
        instance.get_physical_device_properties2(physical_device, &mut properties2);

        Self(Arc::new(DeviceInner {
            instance: instance.clone(),
            device,
            physical_device,
            accel_fns,
            rt_pipeline_fns,
            accel_properties: AccelerationStructureProperties {
                min_scratch_offset_alignment: accel_props
                    .min_acceleration_structure_scratch_offset_alignment,
                max_instance_count: accel_props.max_instance_count,
            },
            rt_pipeline_properties: RayTracingPipelineProperties {
                handle_size: rt_props.shader_group_handle_size,
                handle_alignment: rt_props.shader_group_handle_alignment,
                base_alignment: rt_props.shader_group_base_alignment,
                max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
            },
        }))
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.0.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.0.physical_device
    }

    /// `VK_KHR_acceleration_structure` function table.
    pub fn accel_fns(&self) -> &khr::acceleration_structure::Device {
        &self.0.accel_fns
    }

    /// `VK_KHR_ray_tracing_pipeline` function table.
    pub fn rt_pipeline_fns(&self) -> &khr::ray_tracing_pipeline::Device {
        &self.0.rt_pipeline_fns
    }

    pub fn accel_properties(&self) -> &AccelerationStructureProperties {
        &self.0.accel_properties
    }

    pub fn rt_pipeline_properties(&self) -> &RayTracingPipelineProperties {
        &self.0.rt_pipeline_properties
    }
}

impl Deref for Device {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.0.device
    }
}
impl AsVkHandle for Device {
    type Handle = vk::Device;

    fn vk_handle(&self) -> Self::Handle {
        self.0.device.handle()
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        tracing::info!(device = ?self.device.handle(), "drop device");
        // Safety: Host synchronization rule for vkDestroyDevice:
        // - Host access to device must be externally synchronized.
        // We have &mut self and therefore exclusive control on device.
        unsafe {
            self.device.destroy_device(None);
        }
    }
}
