//! The acceleration structure build engine.
//!
//! [`BlasBuilder`] owns the bottom-level arena and a pending queue. Callers
//! queue builds up front, then drain the queue with [`BlasBuilder::build_batch`]
//! under a scratch budget until it reports [`BuildStatus::Complete`]. Scratch
//! for a batch is one shared allocation, suballocated at aligned offsets, and
//! reclaimed as soon as the batch's fence signals.
//!
//! [`TlasBuilder`] owns one top-level structure and rebuilds or updates it in
//! place, retaining an `Arc` on every bottom-level structure the current
//! instance set references.

use std::sync::Arc;

use ash::vk;
use smallvec::SmallVec;

use crate::{
    accel::{AccelStruct, BlasEntry, BlasId, BlasSet, BuildSizing},
    buffer::{Buffer, BufferLike},
    command::{accel_build_barrier, CommandPool},
    error::{Error, Result},
    geometry::{BlasGeometry, InstanceDesc},
    utils::align_up,
    Allocator, Device, HasDevice,
};

/// Outcome of one budgeted batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildStatus {
    /// The pending queue is empty.
    Complete,
    /// Builds remain; call [`BlasBuilder::build_batch`] again.
    MoreWorkRemains,
}

/// A structure built with `ALLOW_COMPACTION` whose compacted size has been
/// read back. Produced by [`BlasBuilder::build_batch`], consumed by
/// [`BlasBuilder::compact`].
#[derive(Clone, Copy, Debug)]
pub struct CompactionCandidate {
    pub id: BlasId,
    pub original_size: vk::DeviceSize,
    pub compacted_size: vk::DeviceSize,
}

/// Aggregate result of one compaction pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompactionStats {
    pub structures_compacted: usize,
    pub bytes_before: vk::DeviceSize,
    pub bytes_after: vk::DeviceSize,
}

struct PendingBlas {
    id: BlasId,
    geometries: Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    range_infos: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
    scratch_size: vk::DeviceSize,
    flags: vk::BuildAccelerationStructureFlagsKHR,
}

// The stored geometry structs only carry device addresses, never host
// pointers, so they are safe to move across threads with the builder.
unsafe impl Send for PendingBlas {}

struct BatchPlan {
    /// Indices into the pending queue paired with scratch offsets.
    selected: Vec<(usize, vk::DeviceSize)>,
    scratch_size: vk::DeviceSize,
}

/// Plans one batch over the pending queue, first-fit in queue order.
///
/// The queue head is always admitted even when its scratch requirement alone
/// exceeds the budget; otherwise an oversized structure would pin the queue
/// forever. The effective ceiling is therefore
/// `max(budget, largest single requirement)`.
fn plan_batch(
    scratch_sizes: &[vk::DeviceSize],
    budget: vk::DeviceSize,
    alignment: vk::DeviceSize,
) -> BatchPlan {
    let mut selected = Vec::new();
    let mut cursor: vk::DeviceSize = 0;
    for (index, &size) in scratch_sizes.iter().enumerate() {
        let offset = align_up(cursor, alignment);
        if selected.is_empty() || offset + size <= budget {
            selected.push((index, offset));
            cursor = offset + size;
        }
    }
    BatchPlan {
        selected,
        scratch_size: cursor,
    }
}

/// Builds bottom-level acceleration structures in scratch-budgeted batches.
pub struct BlasBuilder {
    allocator: Allocator,
    pool: CommandPool,
    set: BlasSet,
    pending: Vec<PendingBlas>,
    compaction: Vec<CompactionCandidate>,
    stats: CompactionStats,
}

impl BlasBuilder {
    pub fn new(allocator: Allocator, queue_family_index: u32) -> Result<Self> {
        let pool = CommandPool::new(allocator.device().clone(), queue_family_index)?;
        Ok(Self {
            allocator,
            pool,
            set: BlasSet::new(),
            pending: Vec::new(),
            compaction: Vec::new(),
            stats: CompactionStats::default(),
        })
    }

    /// The bottom-level arena. Top-level builds resolve [`BlasId`]s against it.
    pub fn set(&self) -> &BlasSet {
        &self.set
    }

    /// Number of builds still waiting for a batch.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Cumulative compaction savings over the builder's lifetime.
    pub fn statistics(&self) -> CompactionStats {
        self.stats
    }

    /// Queries storage and scratch requirements for a build of `geometries`
    /// without queueing anything.
    pub fn query_sizing(
        &self,
        geometries: &[BlasGeometry],
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Result<BuildSizing> {
        for geometry in geometries {
            geometry.validate()?;
        }
        let vk_geometries: Vec<_> = geometries.iter().map(BlasGeometry::to_vk).collect();
        let primitive_counts: Vec<u32> =
            geometries.iter().map(BlasGeometry::primitive_count).collect();
        Ok(query_sizing(
            self.allocator.device(),
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            flags,
            &vk_geometries,
            &primitive_counts,
        ))
    }

    /// Validates `geometries`, queries sizing, allocates permanent storage and
    /// registers the structure in the arena. The structure's contents are
    /// undefined until a batch containing it completes.
    pub fn queue_build(
        &mut self,
        geometries: &[BlasGeometry],
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Result<BlasId> {
        if geometries.is_empty() {
            return Err(Error::configuration(
                "bottom-level build with no geometries",
            ));
        }
        for geometry in geometries {
            geometry.validate()?;
        }

        let vk_geometries: Vec<_> = geometries.iter().map(BlasGeometry::to_vk).collect();
        let range_infos: Vec<_> = geometries.iter().map(BlasGeometry::range_info).collect();
        let primitive_counts: SmallVec<[u32; 1]> =
            geometries.iter().map(BlasGeometry::primitive_count).collect();

        let sizing = query_sizing(
            self.allocator.device(),
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            flags,
            &vk_geometries,
            &primitive_counts,
        );
        let accel = AccelStruct::new(
            self.allocator.clone(),
            sizing.accel_struct_size,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            flags,
        )?;
        let id = self.set.insert(BlasEntry {
            accel: Arc::new(accel),
            primitive_counts,
            update_scratch_size: sizing.update_scratch_size,
        });
        tracing::debug!(
            ?id,
            storage = sizing.accel_struct_size,
            scratch = sizing.build_scratch_size,
            "queued bottom-level build"
        );
        self.pending.push(PendingBlas {
            id,
            geometries: vk_geometries,
            range_infos,
            scratch_size: sizing.build_scratch_size,
            flags,
        });
        Ok(id)
    }

    /// Builds the largest budget-respecting prefix-biased batch of the pending
    /// queue in one submission, then blocks until it completes.
    ///
    /// Returns [`BuildStatus::MoreWorkRemains`] while the queue is non-empty.
    /// Compacted sizes for every `ALLOW_COMPACTION` structure in the batch are
    /// read back before returning; collect them with [`Self::compact`].
    pub fn build_batch(
        &mut self,
        queue: vk::Queue,
        scratch_budget: vk::DeviceSize,
    ) -> Result<BuildStatus> {
        if self.pending.is_empty() {
            return Ok(BuildStatus::Complete);
        }
        let alignment = self
            .pool
            .device()
            .accel_properties()
            .min_scratch_offset_alignment as vk::DeviceSize;

        let sizes: Vec<_> = self.pending.iter().map(|p| p.scratch_size).collect();
        let plan = plan_batch(&sizes, scratch_budget, alignment);
        if plan.scratch_size > scratch_budget {
            tracing::warn!(
                required = plan.scratch_size,
                budget = scratch_budget,
                "single build exceeds the scratch budget; admitting it anyway"
            );
        }

        let mut in_batch = vec![false; self.pending.len()];
        let mut offsets = Vec::with_capacity(plan.selected.len());
        for &(index, offset) in &plan.selected {
            in_batch[index] = true;
            offsets.push(offset);
        }
        let mut batch = Vec::with_capacity(plan.selected.len());
        let mut rest = Vec::with_capacity(self.pending.len() - plan.selected.len());
        for (index, item) in self.pending.drain(..).enumerate() {
            if in_batch[index] {
                batch.push(item);
            } else {
                rest.push(item);
            }
        }
        self.pending = rest;
        tracing::debug!(
            batch = batch.len(),
            remaining = self.pending.len(),
            scratch = plan.scratch_size,
            "building bottom-level batch"
        );

        let scratch = Buffer::new_private(
            self.allocator.clone(),
            plan.scratch_size,
            alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            "build scratch",
        )?;
        let scratch_base = scratch.device_address();

        let compacting: Vec<usize> = batch
            .iter()
            .enumerate()
            .filter(|(_, item)| {
                item.flags
                    .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION)
            })
            .map(|(index, _)| index)
            .collect();
        let query_pool = if compacting.is_empty() {
            None
        } else {
            Some(QueryPool::new(
                self.pool.device().clone(),
                compacting.len() as u32,
            )?)
        };

        let set = &self.set;
        self.pool.submit_and_wait(queue, |device, cmd| {
            let mut infos = Vec::with_capacity(batch.len());
            let mut range_refs: Vec<&[vk::AccelerationStructureBuildRangeInfoKHR]> =
                Vec::with_capacity(batch.len());
            for (item, &offset) in batch.iter().zip(&offsets) {
                infos.push(vk::AccelerationStructureBuildGeometryInfoKHR {
                    ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                    flags: item.flags,
                    mode: vk::BuildAccelerationStructureModeKHR::BUILD,
                    dst_acceleration_structure: set.entry(item.id)?.accel.raw,
                    geometry_count: item.geometries.len() as u32,
                    p_geometries: item.geometries.as_ptr(),
                    scratch_data: vk::DeviceOrHostAddressKHR {
                        device_address: scratch_base + offset,
                    },
                    ..Default::default()
                });
                range_refs.push(&item.range_infos);
            }
            unsafe {
                device
                    .accel_fns()
                    .cmd_build_acceleration_structures(cmd, &infos, &range_refs);
            }

            if let Some(pool) = &query_pool {
                unsafe {
                    device.cmd_reset_query_pool(cmd, pool.raw, 0, compacting.len() as u32);
                }
                accel_build_barrier(device, cmd);
                let handles: Vec<_> = compacting
                    .iter()
                    .map(|&index| set.entry(batch[index].id).map(|entry| entry.accel.raw))
                    .collect::<Result<_>>()?;
                unsafe {
                    device.accel_fns().cmd_write_acceleration_structures_properties(
                        cmd,
                        &handles,
                        vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                        pool.raw,
                        0,
                    );
                }
            }
            Ok(())
        })?;

        if let Some(pool) = &query_pool {
            let mut compacted = vec![0u64; compacting.len()];
            unsafe {
                self.pool.device().get_query_pool_results::<u64>(
                    pool.raw,
                    0,
                    &mut compacted,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )?;
            }
            for (&index, &compacted_size) in compacting.iter().zip(&compacted) {
                let id = batch[index].id;
                let original_size = self.set.entry(id)?.accel.size();
                self.compaction.push(CompactionCandidate {
                    id,
                    original_size,
                    compacted_size,
                });
            }
        }

        if self.pending.is_empty() {
            Ok(BuildStatus::Complete)
        } else {
            Ok(BuildStatus::MoreWorkRemains)
        }
    }

    /// Structures whose compacted sizes have been read back but not yet
    /// collected by [`Self::compact`].
    pub fn compaction_candidates(&self) -> &[CompactionCandidate] {
        &self.compaction
    }

    /// Copies every pending candidate whose compacted size is smaller than its
    /// current storage into right-sized storage, then swaps the arena entries.
    /// [`BlasId`]s are stable across the swap; device addresses are not, so
    /// top-level structures built before this call must be rebuilt to pick up
    /// the new addresses.
    pub fn compact(&mut self, queue: vk::Queue) -> Result<CompactionStats> {
        let candidates = std::mem::take(&mut self.compaction);
        let mut stats = CompactionStats::default();
        let mut replacements = Vec::new();
        for candidate in candidates {
            if candidate.compacted_size >= candidate.original_size {
                tracing::debug!(
                    id = ?candidate.id,
                    original = candidate.original_size,
                    compacted = candidate.compacted_size,
                    "skipping compaction, no space saved"
                );
                continue;
            }
            let entry = self.set.entry(candidate.id)?;
            let replacement = AccelStruct::new(
                self.allocator.clone(),
                candidate.compacted_size,
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                entry.accel.flags(),
            )?;
            stats.structures_compacted += 1;
            stats.bytes_before += candidate.original_size;
            stats.bytes_after += candidate.compacted_size;
            replacements.push((candidate.id, replacement));
        }
        if replacements.is_empty() {
            return Ok(stats);
        }

        let set = &self.set;
        self.pool.submit_and_wait(queue, |device, cmd| {
            for (id, replacement) in &replacements {
                let info = vk::CopyAccelerationStructureInfoKHR {
                    src: set.entry(*id)?.accel.raw,
                    dst: replacement.raw,
                    mode: vk::CopyAccelerationStructureModeKHR::COMPACT,
                    ..Default::default()
                };
                unsafe {
                    device.accel_fns().cmd_copy_acceleration_structure(cmd, &info);
                }
            }
            Ok(())
        })?;

        for (id, replacement) in replacements {
            // Dropping the returned Arc destroys the original storage unless a
            // top-level structure still retains it.
            let _original = self.set.replace(id, replacement)?;
        }
        self.stats.structures_compacted += stats.structures_compacted;
        self.stats.bytes_before += stats.bytes_before;
        self.stats.bytes_after += stats.bytes_after;
        tracing::info!(
            structures = stats.structures_compacted,
            bytes_before = stats.bytes_before,
            bytes_after = stats.bytes_after,
            "compacted bottom-level structures"
        );
        Ok(stats)
    }

    /// Refits a structure in place after its vertex data moved, without
    /// changing topology.
    ///
    /// `geometries` must reference the same number of geometries with the same
    /// primitive counts as the original build; anything else changed the
    /// topology and needs [`Self::queue_build`] instead. The structure must
    /// have been built with `ALLOW_UPDATE`.
    pub fn update(
        &mut self,
        queue: vk::Queue,
        id: BlasId,
        geometries: &[BlasGeometry],
    ) -> Result<()> {
        let entry = self.set.entry(id)?;
        if !entry
            .accel
            .flags()
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
        {
            return Err(Error::ProtocolViolation(
                "bottom-level index was not built with update support",
            ));
        }
        for geometry in geometries {
            geometry.validate()?;
        }
        let counts: SmallVec<[u32; 1]> =
            geometries.iter().map(BlasGeometry::primitive_count).collect();
        if counts != entry.primitive_counts {
            return Err(Error::configuration(format!(
                "update changed topology (primitive counts {:?} vs {:?}); rebuild instead",
                counts, entry.primitive_counts
            )));
        }
        let update_scratch_size = entry.update_scratch_size;
        let dst = entry.accel.raw;
        let flags = entry.accel.flags();

        let vk_geometries: Vec<_> = geometries.iter().map(BlasGeometry::to_vk).collect();
        let range_infos: Vec<_> = geometries.iter().map(BlasGeometry::range_info).collect();
        let alignment = self
            .pool
            .device()
            .accel_properties()
            .min_scratch_offset_alignment as vk::DeviceSize;
        let scratch = Buffer::new_private(
            self.allocator.clone(),
            update_scratch_size,
            alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            "update scratch",
        )?;

        self.pool.submit_and_wait(queue, |device, cmd| {
            let info = vk::AccelerationStructureBuildGeometryInfoKHR {
                ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                flags,
                mode: vk::BuildAccelerationStructureModeKHR::UPDATE,
                src_acceleration_structure: dst,
                dst_acceleration_structure: dst,
                geometry_count: vk_geometries.len() as u32,
                p_geometries: vk_geometries.as_ptr(),
                scratch_data: vk::DeviceOrHostAddressKHR {
                    device_address: scratch.device_address(),
                },
                ..Default::default()
            };
            unsafe {
                device
                    .accel_fns()
                    .cmd_build_acceleration_structures(cmd, &[info], &[&range_infos]);
            }
            Ok(())
        })
    }

    /// Removes a bottom-level structure from the arena and destroys it.
    ///
    /// Queued-but-unbuilt work and pending compaction candidates for it are
    /// dropped. Fails while a top-level structure still references it.
    pub fn remove(&mut self, id: BlasId) -> Result<()> {
        self.set.remove(id)?;
        purge_queued(&mut self.pending, id);
        self.compaction.retain(|candidate| candidate.id != id);
        Ok(())
    }
}

/// Drops queued builds for a removed structure. A stale queue entry would make
/// the next batch fail mid-recording and lose every other build planned into
/// that batch.
fn purge_queued(pending: &mut Vec<PendingBlas>, id: BlasId) {
    pending.retain(|item| item.id != id);
}

fn query_sizing(
    device: &Device,
    ty: vk::AccelerationStructureTypeKHR,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    geometries: &[vk::AccelerationStructureGeometryKHR],
    primitive_counts: &[u32],
) -> BuildSizing {
    let info = vk::AccelerationStructureBuildGeometryInfoKHR {
        ty,
        flags,
        mode: vk::BuildAccelerationStructureModeKHR::BUILD,
        geometry_count: geometries.len() as u32,
        p_geometries: geometries.as_ptr(),
        ..Default::default()
    };
    let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        device.accel_fns().get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &info,
            primitive_counts,
            &mut sizes,
        )
    };
    BuildSizing {
        accel_struct_size: sizes.acceleration_structure_size,
        build_scratch_size: sizes.build_scratch_size,
        update_scratch_size: sizes.update_scratch_size,
    }
}

struct QueryPool {
    device: Device,
    raw: vk::QueryPool,
}

impl QueryPool {
    fn new(device: Device, query_count: u32) -> Result<Self> {
        let raw = unsafe {
            device.create_query_pool(
                &vk::QueryPoolCreateInfo {
                    query_type: vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    query_count,
                    ..Default::default()
                },
                None,
            )?
        };
        Ok(Self { device, raw })
    }
}

impl Drop for QueryPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_query_pool(self.raw, None);
        }
    }
}

const INSTANCE_SIZE: vk::DeviceSize =
    std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as vk::DeviceSize;

/// Required start alignment for instance input buffers
/// (VUID-vkCmdBuildAccelerationStructuresKHR-pInfos-03715).
const INSTANCE_BUFFER_ALIGNMENT: vk::DeviceSize = 16;

/// Builds and maintains one top-level acceleration structure.
pub struct TlasBuilder {
    allocator: Allocator,
    pool: CommandPool,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    accel: Option<Arc<AccelStruct>>,
    instance_buffer: Option<Buffer>,
    scratch: Option<Buffer>,
    instance_count: u32,
    /// Bottom-level structures the current instance set references. Held so
    /// their device addresses inside the structure stay valid until the next
    /// rebuild or drop.
    retained: Vec<Arc<AccelStruct>>,
}

impl TlasBuilder {
    pub fn new(
        allocator: Allocator,
        queue_family_index: u32,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Result<Self> {
        let pool = CommandPool::new(allocator.device().clone(), queue_family_index)?;
        Ok(Self {
            allocator,
            pool,
            flags,
            accel: None,
            instance_buffer: None,
            scratch: None,
            instance_count: 0,
            retained: Vec::new(),
        })
    }

    /// The current top-level structure, once built.
    pub fn tlas(&self) -> Option<&Arc<AccelStruct>> {
        self.accel.as_ref()
    }

    /// Builds the top-level structure over `instances` from scratch, blocking
    /// until it completes. Storage, the instance buffer and scratch are reused
    /// across calls when they still fit.
    pub fn build(
        &mut self,
        queue: vk::Queue,
        set: &BlasSet,
        instances: &[InstanceDesc],
    ) -> Result<()> {
        self.submit(queue, set, instances, vk::BuildAccelerationStructureModeKHR::BUILD)
    }

    /// Refits the existing structure for new instance transforms, blocking
    /// until it completes.
    ///
    /// The builder must have been created with `ALLOW_UPDATE` and [`Self::build`]
    /// must have run. The instance count must match the last build; adding or
    /// removing instances changes the structure's shape and requires a rebuild.
    pub fn update(
        &mut self,
        queue: vk::Queue,
        set: &BlasSet,
        instances: &[InstanceDesc],
    ) -> Result<()> {
        if self.accel.is_none() {
            return Err(Error::ProtocolViolation(
                "top-level update before the first build",
            ));
        }
        if !self
            .flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
        {
            return Err(Error::ProtocolViolation(
                "top-level index was not built with update support",
            ));
        }
        if instances.len() as u32 != self.instance_count {
            return Err(Error::configuration(format!(
                "top-level update changed instance count ({} vs {}); rebuild instead",
                instances.len(),
                self.instance_count
            )));
        }
        self.submit(queue, set, instances, vk::BuildAccelerationStructureModeKHR::UPDATE)
    }

    fn submit(
        &mut self,
        queue: vk::Queue,
        set: &BlasSet,
        instances: &[InstanceDesc],
        mode: vk::BuildAccelerationStructureModeKHR,
    ) -> Result<()> {
        let device = self.allocator.device().clone();
        let max_instances = device.accel_properties().max_instance_count;
        if instances.len() as u64 > max_instances {
            return Err(Error::configuration(format!(
                "{} instances exceeds the device limit of {max_instances}",
                instances.len()
            )));
        }

        let mut records = Vec::with_capacity(instances.len());
        let mut retained = Vec::with_capacity(instances.len());
        for instance in instances {
            instance.validate()?;
            let entry = set.entry(instance.blas)?;
            records.push(instance.packed(entry.accel.device_address()));
            retained.push(entry.accel.clone());
        }
        self.upload_instances(&records)?;
        let instance_address = self
            .instance_buffer
            .as_ref()
            .map(|buffer| buffer.device_address())
            .unwrap_or(0);

        let geometry = vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::INSTANCES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR {
                    array_of_pointers: vk::FALSE,
                    data: vk::DeviceOrHostAddressConstKHR {
                        device_address: instance_address,
                    },
                    ..Default::default()
                },
            },
            ..Default::default()
        };
        let geometries = [geometry];
        let primitive_count = instances.len() as u32;
        let sizing = query_sizing(
            &device,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            self.flags,
            &geometries,
            &[primitive_count],
        );

        if mode == vk::BuildAccelerationStructureModeKHR::BUILD {
            let fits = self
                .accel
                .as_ref()
                .is_some_and(|accel| accel.size() >= sizing.accel_struct_size);
            if !fits {
                self.accel = Some(Arc::new(AccelStruct::new(
                    self.allocator.clone(),
                    sizing.accel_struct_size,
                    vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                    self.flags,
                )?));
            }
        }
        // Updates reuse the build-sized scratch retained from the last build.
        let scratch_needed = if mode == vk::BuildAccelerationStructureModeKHR::UPDATE {
            sizing.update_scratch_size
        } else if self
            .flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
        {
            sizing.build_scratch_size.max(sizing.update_scratch_size)
        } else {
            sizing.build_scratch_size
        };
        let scratch_fits = self
            .scratch
            .as_ref()
            .is_some_and(|scratch| scratch.size() >= scratch_needed);
        if !scratch_fits {
            let alignment =
                device.accel_properties().min_scratch_offset_alignment as vk::DeviceSize;
            self.scratch = Some(Buffer::new_private(
                self.allocator.clone(),
                scratch_needed,
                alignment,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                "top-level scratch",
            )?);
        }

        let accel = self
            .accel
            .as_ref()
            .ok_or(Error::ProtocolViolation("top-level structure missing"))?;
        let dst = accel.raw;
        let src = if mode == vk::BuildAccelerationStructureModeKHR::UPDATE {
            dst
        } else {
            vk::AccelerationStructureKHR::null()
        };
        let scratch_address = self
            .scratch
            .as_ref()
            .map(|scratch| scratch.device_address())
            .unwrap_or(0);
        tracing::debug!(
            instances = primitive_count,
            ?mode,
            storage = sizing.accel_struct_size,
            "building top-level structure"
        );

        let flags = self.flags;
        self.pool.submit_and_wait(queue, |device, cmd| {
            let info = vk::AccelerationStructureBuildGeometryInfoKHR {
                ty: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                flags,
                mode,
                src_acceleration_structure: src,
                dst_acceleration_structure: dst,
                geometry_count: 1,
                p_geometries: geometries.as_ptr(),
                scratch_data: vk::DeviceOrHostAddressKHR {
                    device_address: scratch_address,
                },
                ..Default::default()
            };
            let range_info = vk::AccelerationStructureBuildRangeInfoKHR {
                primitive_count,
                ..Default::default()
            };
            unsafe {
                device
                    .accel_fns()
                    .cmd_build_acceleration_structures(cmd, &[info], &[&[range_info]]);
            }
            Ok(())
        })?;

        self.retained = retained;
        self.instance_count = primitive_count;
        Ok(())
    }

    fn upload_instances(
        &mut self,
        records: &[vk::AccelerationStructureInstanceKHR],
    ) -> Result<()> {
        let needed = (records.len().max(1) as vk::DeviceSize) * INSTANCE_SIZE;
        let fits = self
            .instance_buffer
            .as_ref()
            .is_some_and(|buffer| buffer.size() >= needed);
        if !fits {
            self.instance_buffer = Some(Buffer::new_upload(
                self.allocator.clone(),
                needed,
                INSTANCE_BUFFER_ALIGNMENT,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                "instance input buffer",
            )?);
        }
        if records.is_empty() {
            return Ok(());
        }
        let buffer = self
            .instance_buffer
            .as_mut()
            .ok_or(Error::ProtocolViolation("instance buffer missing"))?;
        let dst = buffer
            .as_slice_mut()
            .ok_or(Error::ProtocolViolation("instance buffer not mapped"))?;
        let bytes = unsafe {
            std::slice::from_raw_parts(
                records.as_ptr() as *const u8,
                records.len() * INSTANCE_SIZE as usize,
            )
        };
        dst[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: vk::DeviceSize = 1024 * 1024;

    #[test]
    fn test_batch_plan_splits_on_budget() {
        // 10 MB fits, 15 MB would overflow, 8 MB still fits after the first.
        let plan = plan_batch(&[10 * MB, 15 * MB, 8 * MB], 20 * MB, 128);
        let indices: Vec<_> = plan.selected.iter().map(|&(i, _)| i).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(plan.selected[0].1, 0);
        assert_eq!(plan.selected[1].1, 10 * MB);
        assert_eq!(plan.scratch_size, 18 * MB);

        // Second round over the remainder.
        let plan = plan_batch(&[15 * MB], 20 * MB, 128);
        let indices: Vec<_> = plan.selected.iter().map(|&(i, _)| i).collect();
        assert_eq!(indices, vec![0]);
    }

    #[test]
    fn test_batch_plan_admits_oversized_head() {
        let plan = plan_batch(&[30 * MB, 5 * MB], 10 * MB, 128);
        let indices: Vec<_> = plan.selected.iter().map(|&(i, _)| i).collect();
        // The head always goes through; the follower no longer fits.
        assert_eq!(indices, vec![0]);
        assert_eq!(plan.scratch_size, 30 * MB);
    }

    #[test]
    fn test_batch_plan_aligns_offsets() {
        let plan = plan_batch(&[100, 100, 100], 1024, 128);
        let offsets: Vec<_> = plan.selected.iter().map(|&(_, o)| o).collect();
        assert_eq!(offsets, vec![0, 128, 256]);
        assert_eq!(plan.scratch_size, 356);
    }

    #[test]
    fn test_batch_plan_fills_around_skips() {
        // The skipped middle element does not block later small builds.
        let plan = plan_batch(&[4, 1000, 4, 4], 16, 4);
        let indices: Vec<_> = plan.selected.iter().map(|&(i, _)| i).collect();
        assert_eq!(indices, vec![0, 2, 3]);
    }

    #[test]
    fn test_batch_plan_empty() {
        let plan = plan_batch(&[], 1024, 128);
        assert!(plan.selected.is_empty());
        assert_eq!(plan.scratch_size, 0);
    }

    fn queued(id: u32) -> PendingBlas {
        PendingBlas {
            id: BlasId(id),
            geometries: Vec::new(),
            range_infos: Vec::new(),
            scratch_size: 0,
            flags: vk::BuildAccelerationStructureFlagsKHR::empty(),
        }
    }

    #[test]
    fn test_removed_structure_leaves_the_queue() {
        // A removed id must not survive into the next batch; the co-queued
        // builds stay, in order.
        let mut pending = vec![queued(0), queued(1), queued(2)];
        purge_queued(&mut pending, BlasId(1));
        let ids: Vec<_> = pending.iter().map(|item| item.id).collect();
        assert_eq!(ids, vec![BlasId(0), BlasId(2)]);

        // Removing an id with no queued work is a no-op.
        purge_queued(&mut pending, BlasId(7));
        assert_eq!(pending.len(), 2);
    }
}
