//! Shader binding table layout and population.
//!
//! A ray tracing pipeline's shader groups are opaque handles; dispatching rays
//! needs those handles laid out in a buffer split into four regions (ray
//! generation, miss, hit, callable), each with its own stride and device
//! address alignment rules. [`SbtBuilder`] computes that layout from the
//! device's pipeline properties and writes the bytes; all the arithmetic is
//! host-side and independent of any live device, so it is exercised directly
//! by tests with synthetic handles.
//!
//! Layout rules:
//! - every entry is a group handle followed by the caller's shader record,
//!   zero-padded to the region stride;
//! - the region stride is the handle size plus the largest record in that
//!   region, rounded up to `shaderGroupHandleAlignment`;
//! - each region starts at a multiple of `shaderGroupBaseAlignment`;
//! - the ray generation region is special: its stride must equal its size,
//!   so it holds exactly one entry.

use ash::vk;

use crate::{
    buffer::{Buffer, BufferLike},
    device::RayTracingPipelineProperties,
    error::{Error, Result},
    utils::align_up,
    Allocator, Device, HasDevice,
};

/// The four shader binding table regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupKind {
    Raygen,
    Miss,
    Hit,
    Callable,
}

impl GroupKind {
    const ALL: [GroupKind; 4] = [
        GroupKind::Raygen,
        GroupKind::Miss,
        GroupKind::Hit,
        GroupKind::Callable,
    ];

    fn index(self) -> usize {
        match self {
            GroupKind::Raygen => 0,
            GroupKind::Miss => 1,
            GroupKind::Hit => 2,
            GroupKind::Callable => 3,
        }
    }

    fn name(self) -> &'static str {
        match self {
            GroupKind::Raygen => "ray generation",
            GroupKind::Miss => "miss",
            GroupKind::Hit => "hit",
            GroupKind::Callable => "callable",
        }
    }
}

/// Opaque shader group handles fetched from a compiled pipeline.
///
/// Handles are stored tightly packed at `handle_size` intervals, exactly as
/// `vkGetRayTracingShaderGroupHandlesKHR` returns them; alignment only matters
/// once they are copied into the table.
pub struct SbtHandles {
    data: Vec<u8>,
    handle_size: u32,
}

impl SbtHandles {
    /// Fetches all `group_count` handles from a compiled ray tracing pipeline.
    pub fn from_pipeline(device: &Device, pipeline: vk::Pipeline, group_count: u32) -> Result<Self> {
        let handle_size = device.rt_pipeline_properties().handle_size;
        let data = unsafe {
            device.rt_pipeline_fns().get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                group_count,
                (group_count * handle_size) as usize,
            )?
        };
        Ok(Self { data, handle_size })
    }

    /// Wraps tightly packed handle bytes directly.
    pub fn from_bytes(data: Vec<u8>, handle_size: u32) -> Result<Self> {
        if handle_size == 0 || data.len() % handle_size as usize != 0 {
            return Err(Error::configuration(format!(
                "{} handle bytes do not divide into {handle_size}-byte handles",
                data.len()
            )));
        }
        Ok(Self { data, handle_size })
    }

    pub fn handle_size(&self) -> u32 {
        self.handle_size
    }

    pub fn group_count(&self) -> u32 {
        (self.data.len() / self.handle_size as usize) as u32
    }

    fn handle(&self, group_index: u32) -> Result<&[u8]> {
        let size = self.handle_size as usize;
        let start = group_index as usize * size;
        self.data.get(start..start + size).ok_or_else(|| {
            Error::configuration(format!(
                "shader group {group_index} is out of range for {} fetched handles",
                self.group_count()
            ))
        })
    }
}

/// Device address regions for `vkCmdTraceRaysKHR`, one per [`GroupKind`].
/// Regions with no entries are zeroed.
#[derive(Clone, Copy, Debug, Default)]
pub struct SbtRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

struct SbtEntry {
    group_index: u32,
    record: Vec<u8>,
}

/// Computes shader binding table layouts and writes table contents.
///
/// Entry order within each region is insertion order and nothing else; the
/// same sequence of calls always produces the same layout, so instance
/// `sbt_record_offset` values assigned against one layout stay valid across
/// rebuilds of the same pipeline.
pub struct SbtBuilder {
    properties: RayTracingPipelineProperties,
    entries: [Vec<SbtEntry>; 4],
    record_capacity: [Option<u32>; 4],
    regions: Option<SbtRegions>,
}

impl SbtBuilder {
    pub fn new(properties: RayTracingPipelineProperties) -> Self {
        Self {
            properties,
            entries: Default::default(),
            record_capacity: Default::default(),
            regions: None,
        }
    }

    /// Classifies `groups` the way the pipeline was created and appends one
    /// table entry per group, in group order.
    ///
    /// General groups take the kind of the shader stage they reference; both
    /// hit group types map to the hit region.
    pub fn discover_groups(
        &mut self,
        stages: &[vk::ShaderStageFlags],
        groups: &[vk::RayTracingShaderGroupCreateInfoKHR],
    ) -> Result<()> {
        for (group_index, group) in groups.iter().enumerate() {
            let group_index = group_index as u32;
            let kind = match group.ty {
                vk::RayTracingShaderGroupTypeKHR::GENERAL => {
                    let stage = stages.get(group.general_shader as usize).ok_or_else(|| {
                        Error::configuration(format!(
                            "group {group_index} references shader {} but only {} stages exist",
                            group.general_shader,
                            stages.len()
                        ))
                    })?;
                    match *stage {
                        vk::ShaderStageFlags::RAYGEN_KHR => GroupKind::Raygen,
                        vk::ShaderStageFlags::MISS_KHR => GroupKind::Miss,
                        vk::ShaderStageFlags::CALLABLE_KHR => GroupKind::Callable,
                        other => {
                            return Err(Error::configuration(format!(
                                "general group {group_index} references stage {other:?}"
                            )))
                        }
                    }
                }
                vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
                | vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP => GroupKind::Hit,
                other => {
                    return Err(Error::configuration(format!(
                        "group {group_index} has unknown type {other:?}"
                    )))
                }
            };
            self.add_group(kind, group_index)?;
        }
        Ok(())
    }

    /// Appends one entry referencing pipeline group `group_index` to the given
    /// region. Entry index within the region is returned.
    pub fn add_group(&mut self, kind: GroupKind, group_index: u32) -> Result<usize> {
        let entries = &mut self.entries[kind.index()];
        if kind == GroupKind::Raygen && !entries.is_empty() {
            return Err(Error::configuration(
                "a dispatch has exactly one ray generation entry; \
                 use a separate table for each ray generation group",
            ));
        }
        self.regions = None;
        entries.push(SbtEntry {
            group_index,
            record: Vec::new(),
        });
        Ok(entries.len() - 1)
    }

    /// Reserves `capacity` record bytes in every entry of a region, so records
    /// attached later cannot change the layout. Without a capacity the region
    /// stride grows to the largest attached record.
    pub fn set_record_capacity(&mut self, kind: GroupKind, capacity: u32) {
        self.record_capacity[kind.index()] = Some(capacity);
        self.regions = None;
    }

    /// Attaches inline shader record data to an entry, available in shaders
    /// through the shader record buffer.
    pub fn attach_record(&mut self, kind: GroupKind, entry: usize, record: &[u8]) -> Result<()> {
        if let Some(capacity) = self.record_capacity[kind.index()] {
            if record.len() > capacity as usize {
                return Err(Error::configuration(format!(
                    "{} byte record exceeds the {} region capacity of {capacity}",
                    record.len(),
                    kind.name()
                )));
            }
        }
        let entries = &mut self.entries[kind.index()];
        let count = entries.len();
        let slot = entries.get_mut(entry).ok_or_else(|| {
            Error::configuration(format!(
                "no {} entry {entry}; {count} entries exist",
                kind.name()
            ))
        })?;
        slot.record = record.to_vec();
        self.regions = None;
        Ok(())
    }

    fn max_record(&self, kind: GroupKind) -> u32 {
        let attached = self.entries[kind.index()]
            .iter()
            .map(|entry| entry.record.len() as u32)
            .max()
            .unwrap_or(0);
        attached.max(self.record_capacity[kind.index()].unwrap_or(0))
    }

    /// Stride of one entry in the given region: handle plus largest record,
    /// rounded up to the handle alignment.
    pub fn entry_stride(&self, kind: GroupKind) -> vk::DeviceSize {
        align_up(
            (self.properties.handle_size + self.max_record(kind)) as vk::DeviceSize,
            self.properties.handle_alignment as vk::DeviceSize,
        )
    }

    fn region_span(&self, kind: GroupKind) -> vk::DeviceSize {
        let count = self.entries[kind.index()].len() as vk::DeviceSize;
        if count == 0 {
            return 0;
        }
        align_up(
            count * self.entry_stride(kind),
            self.properties.base_alignment as vk::DeviceSize,
        )
    }

    /// Total buffer size and required start address alignment for the current
    /// set of entries.
    ///
    /// Fails until exactly one ray generation entry exists.
    pub fn buffer_requirements(&self) -> Result<(vk::DeviceSize, vk::DeviceSize)> {
        if self.entries[GroupKind::Raygen.index()].is_empty() {
            return Err(Error::configuration(
                "shader binding table without a ray generation entry",
            ));
        }
        let size = GroupKind::ALL
            .iter()
            .map(|&kind| self.region_span(kind))
            .sum();
        Ok((size, self.properties.base_alignment as vk::DeviceSize))
    }

    /// Regions from the last [`Self::populate`] call, invalidated whenever
    /// entries, records or capacities change afterwards.
    pub fn regions(&self) -> Option<&SbtRegions> {
        self.regions.as_ref()
    }

    /// Writes handles and records into `dst` and returns the dispatch regions
    /// for a table that will live at `buffer_address`.
    ///
    /// `dst` must hold at least the size from [`Self::buffer_requirements`]
    /// and `buffer_address` must honor the returned alignment. Nothing is
    /// written unless every input validates.
    pub fn populate(
        &mut self,
        handles: &SbtHandles,
        buffer_address: vk::DeviceAddress,
        dst: &mut [u8],
    ) -> Result<SbtRegions> {
        let (size, alignment) = self.buffer_requirements()?;
        if handles.handle_size() != self.properties.handle_size {
            return Err(Error::configuration(format!(
                "handle size mismatch: fetched {} but the layout assumes {}",
                handles.handle_size(),
                self.properties.handle_size
            )));
        }
        if buffer_address % alignment != 0 {
            return Err(Error::configuration(format!(
                "table address {buffer_address:#x} is not {alignment}-byte aligned"
            )));
        }
        if (dst.len() as vk::DeviceSize) < size {
            return Err(Error::configuration(format!(
                "table buffer holds {} bytes but the layout needs {size}",
                dst.len()
            )));
        }

        for &kind in &GroupKind::ALL {
            for entry in &self.entries[kind.index()] {
                handles.handle(entry.group_index)?;
            }
        }

        let mut regions = SbtRegions::default();
        let mut cursor: vk::DeviceSize = 0;
        for &kind in &GroupKind::ALL {
            let entries = &self.entries[kind.index()];
            if entries.is_empty() {
                continue;
            }
            let stride = self.entry_stride(kind);
            let region = vk::StridedDeviceAddressRegionKHR {
                device_address: buffer_address + cursor,
                stride,
                // The ray generation region holds one entry and its size must
                // equal its stride; other regions span their full base-aligned
                // extent.
                size: if kind == GroupKind::Raygen {
                    stride
                } else {
                    self.region_span(kind)
                },
            };
            for (index, entry) in entries.iter().enumerate() {
                let handle = handles.handle(entry.group_index)?;
                let start = (cursor + index as vk::DeviceSize * stride) as usize;
                dst[start..start + handle.len()].copy_from_slice(handle);
                let record_start = start + handle.len();
                dst[record_start..record_start + entry.record.len()]
                    .copy_from_slice(&entry.record);
                // The remainder of the entry up to the stride stays zero.
            }
            cursor += self.region_span(kind);
            match kind {
                GroupKind::Raygen => regions.raygen = region,
                GroupKind::Miss => regions.miss = region,
                GroupKind::Hit => regions.hit = region,
                GroupKind::Callable => regions.callable = region,
            }
        }
        tracing::debug!(
            size,
            raygen_stride = regions.raygen.stride,
            miss = self.entries[GroupKind::Miss.index()].len(),
            hit = self.entries[GroupKind::Hit.index()].len(),
            callable = self.entries[GroupKind::Callable.index()].len(),
            "populated shader binding table"
        );
        self.regions = Some(regions);
        Ok(regions)
    }

    /// Allocates a host-visible table buffer, populates it and returns the
    /// ready-to-dispatch table.
    pub fn build(
        &mut self,
        allocator: &Allocator,
        handles: &SbtHandles,
    ) -> Result<ShaderBindingTable> {
        let (size, alignment) = self.buffer_requirements()?;
        let mut buffer = Buffer::new_upload(
            allocator.clone(),
            size,
            alignment,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            "shader binding table",
        )?;
        let address = buffer.device_address();
        let dst = buffer
            .as_slice_mut()
            .ok_or(Error::ProtocolViolation("table buffer not mapped"))?;
        let regions = self.populate(handles, address, dst)?;
        Ok(ShaderBindingTable { buffer, regions })
    }
}

/// A populated shader binding table: the backing buffer plus the four regions
/// to hand to `vkCmdTraceRaysKHR`.
pub struct ShaderBindingTable {
    buffer: Buffer,
    regions: SbtRegions,
}

impl ShaderBindingTable {
    pub fn regions(&self) -> &SbtRegions {
        &self.regions
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}

impl HasDevice for ShaderBindingTable {
    fn device(&self) -> &Device {
        self.buffer.device()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> RayTracingPipelineProperties {
        RayTracingPipelineProperties {
            handle_size,
            handle_alignment,
            base_alignment,
            max_ray_recursion_depth: 1,
        }
    }

    fn synthetic_handles(group_count: u32, handle_size: u32) -> SbtHandles {
        let mut data = Vec::new();
        for group in 0..group_count {
            data.extend(std::iter::repeat(group as u8 + 1).take(handle_size as usize));
        }
        SbtHandles::from_bytes(data, handle_size).unwrap()
    }

    fn raygen_miss_two_hit(properties: RayTracingPipelineProperties) -> SbtBuilder {
        let mut builder = SbtBuilder::new(properties);
        builder.add_group(GroupKind::Raygen, 0).unwrap();
        builder.add_group(GroupKind::Miss, 1).unwrap();
        builder.add_group(GroupKind::Hit, 2).unwrap();
        builder.add_group(GroupKind::Hit, 3).unwrap();
        builder
    }

    #[test]
    fn test_layout_one_raygen_one_miss_two_hit() {
        // handle 32, entry alignment 32, region alignment 64.
        let mut builder = raygen_miss_two_hit(props(32, 32, 64));
        let (size, alignment) = builder.buffer_requirements().unwrap();
        // raygen occupies 64 (32 rounded up), miss 64, hit 64.
        assert_eq!(size, 192);
        assert_eq!(alignment, 64);

        let handles = synthetic_handles(4, 32);
        let mut table = vec![0u8; size as usize];
        let regions = builder.populate(&handles, 0x40000, &mut table).unwrap();

        assert_eq!(regions.raygen.device_address, 0x40000);
        assert_eq!(regions.raygen.stride, 32);
        assert_eq!(regions.raygen.size, 32);
        assert_eq!(regions.miss.device_address, 0x40040);
        assert_eq!(regions.miss.stride, 32);
        assert_eq!(regions.miss.size, 64);
        assert_eq!(regions.hit.device_address, 0x40080);
        assert_eq!(regions.hit.stride, 32);
        assert_eq!(regions.hit.size, 64);
        assert_eq!(regions.callable.device_address, 0);
        assert_eq!(regions.callable.size, 0);
        assert_eq!(
            builder.regions().unwrap().hit.device_address,
            regions.hit.device_address
        );

        // Handle bytes land at each entry's start; gaps stay zero.
        assert_eq!(&table[0..32], &[1u8; 32]);
        assert_eq!(&table[32..64], &[0u8; 32]);
        assert_eq!(&table[64..96], &[2u8; 32]);
        assert_eq!(&table[128..160], &[3u8; 32]);
        assert_eq!(&table[160..192], &[4u8; 32]);
    }

    #[test]
    fn test_layout_is_deterministic() {
        let make = || {
            let mut builder = raygen_miss_two_hit(props(32, 32, 64));
            let handles = synthetic_handles(4, 32);
            let (size, _) = builder.buffer_requirements().unwrap();
            let mut table = vec![0u8; size as usize];
            let regions = builder.populate(&handles, 0x40000, &mut table).unwrap();
            (table, regions.hit.device_address)
        };
        let (a, hit_a) = make();
        let (b, hit_b) = make();
        assert_eq!(a, b);
        assert_eq!(hit_a, hit_b);
    }

    #[test]
    fn test_records_widen_the_region_stride() {
        let mut builder = SbtBuilder::new(props(16, 16, 64));
        builder.add_group(GroupKind::Raygen, 0).unwrap();
        let first = builder.add_group(GroupKind::Hit, 1).unwrap();
        builder.add_group(GroupKind::Hit, 2).unwrap();
        builder
            .attach_record(GroupKind::Hit, first, &[0xAA; 9])
            .unwrap();

        // 16-byte handle plus 9-byte record rounds up to 32.
        assert_eq!(builder.entry_stride(GroupKind::Hit), 32);
        // The raygen region is unaffected by hit records.
        assert_eq!(builder.entry_stride(GroupKind::Raygen), 16);

        let handles = synthetic_handles(3, 16);
        let (size, _) = builder.buffer_requirements().unwrap();
        let mut table = vec![0u8; size as usize];
        builder.populate(&handles, 0x1000, &mut table).unwrap();
        // hit region starts at 64; entry 0 is handle then record then zeros.
        assert_eq!(&table[64..80], &[2u8; 16]);
        assert_eq!(&table[80..89], &[0xAA; 9]);
        assert_eq!(&table[89..96], &[0u8; 7]);
        // entry 1 sits one stride later with an empty record.
        assert_eq!(&table[96..112], &[3u8; 16]);
    }

    #[test]
    fn test_record_capacity_fixes_the_layout() {
        let mut builder = SbtBuilder::new(props(16, 16, 64));
        builder.add_group(GroupKind::Raygen, 0).unwrap();
        builder.set_record_capacity(GroupKind::Miss, 16);
        let entry = builder.add_group(GroupKind::Miss, 1).unwrap();
        assert_eq!(builder.entry_stride(GroupKind::Miss), 32);

        // Within capacity.
        builder
            .attach_record(GroupKind::Miss, entry, &[1, 2, 3])
            .unwrap();
        assert_eq!(builder.entry_stride(GroupKind::Miss), 32);

        // Over capacity.
        let err = builder
            .attach_record(GroupKind::Miss, entry, &[0; 17])
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_exactly_one_raygen_entry() {
        let mut builder = SbtBuilder::new(props(32, 32, 64));
        assert!(matches!(
            builder.buffer_requirements(),
            Err(Error::Configuration(_))
        ));
        builder.add_group(GroupKind::Raygen, 0).unwrap();
        assert!(builder.add_group(GroupKind::Raygen, 1).is_err());
    }

    #[test]
    fn test_discovery_classifies_by_stage() {
        let stages = [
            vk::ShaderStageFlags::RAYGEN_KHR,
            vk::ShaderStageFlags::MISS_KHR,
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            vk::ShaderStageFlags::CALLABLE_KHR,
        ];
        let general = |shader: u32| vk::RayTracingShaderGroupCreateInfoKHR {
            ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
            general_shader: shader,
            closest_hit_shader: vk::SHADER_UNUSED_KHR,
            any_hit_shader: vk::SHADER_UNUSED_KHR,
            intersection_shader: vk::SHADER_UNUSED_KHR,
            ..Default::default()
        };
        let hit = vk::RayTracingShaderGroupCreateInfoKHR {
            ty: vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
            general_shader: vk::SHADER_UNUSED_KHR,
            closest_hit_shader: 2,
            any_hit_shader: vk::SHADER_UNUSED_KHR,
            intersection_shader: vk::SHADER_UNUSED_KHR,
            ..Default::default()
        };

        let mut builder = SbtBuilder::new(props(32, 32, 64));
        builder
            .discover_groups(&stages, &[general(0), general(1), hit, general(3)])
            .unwrap();
        let (size, _) = builder.buffer_requirements().unwrap();
        // Four 64-byte regions.
        assert_eq!(size, 256);

        let handles = synthetic_handles(4, 32);
        let mut table = vec![0u8; size as usize];
        let regions = builder.populate(&handles, 0, &mut table).unwrap();
        assert_eq!(regions.miss.device_address, 64);
        assert_eq!(regions.hit.device_address, 128);
        assert_eq!(regions.callable.device_address, 192);
        // Each region leads with its group's handle bytes.
        assert_eq!(&table[64..96], &[2u8; 32]);
        assert_eq!(&table[128..160], &[3u8; 32]);
        assert_eq!(&table[192..224], &[4u8; 32]);
    }

    #[test]
    fn test_populate_rejects_misaligned_address() {
        let mut builder = raygen_miss_two_hit(props(32, 32, 64));
        let handles = synthetic_handles(4, 32);
        let mut table = vec![0u8; 192];
        assert!(builder.populate(&handles, 0x40020, &mut table).is_err());
    }

    #[test]
    fn test_populate_rejects_short_buffer_and_missing_handles() {
        let mut builder = raygen_miss_two_hit(props(32, 32, 64));
        let handles = synthetic_handles(4, 32);
        let mut short = vec![0u8; 64];
        assert!(builder.populate(&handles, 0, &mut short).is_err());

        // Only 3 handles for 4 referenced groups.
        let handles = synthetic_handles(3, 32);
        let mut table = vec![0u8; 192];
        assert!(builder.populate(&handles, 0, &mut table).is_err());
    }
}
