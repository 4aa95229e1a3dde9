//! Acceleration structure handles and the bottom-level arena.
//!
//! A [`AccelStruct`] owns its backing buffer and raw handle; dropping it
//! destroys both. Bottom-level structures live in a [`BlasSet`] keyed by
//! stable [`BlasId`]s, and top-level builds resolve IDs to device addresses
//! just-in-time while retaining an `Arc` on every structure they reference.
//! That retention is what makes the spec's ownership ordering hold: a
//! bottom-level structure cannot be removed from the set while a top-level
//! structure still points at its address.

use std::sync::Arc;

use ash::vk;
use smallvec::SmallVec;

use crate::{
    buffer::{Buffer, BufferLike},
    error::{Error, Result},
    utils::AsVkHandle,
    Allocator, Device, HasDevice,
};

/// Sizing for one acceleration structure build, from
/// `vkGetAccelerationStructureBuildSizesKHR`.
///
/// Must be requeried whenever the geometry composition changes; allocating
/// storage from stale sizing is an undersized-buffer bug.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuildSizing {
    /// Bytes of permanent storage for the structure itself.
    pub accel_struct_size: vk::DeviceSize,
    /// Transient scratch bytes needed while building.
    pub build_scratch_size: vk::DeviceSize,
    /// Transient scratch bytes needed for an in-place update.
    pub update_scratch_size: vk::DeviceSize,
}

/// A Vulkan acceleration structure together with its backing storage.
///
/// Two kinds exist: bottom-level (over triangles or AABBs) and top-level
/// (over instances of bottom-level structures). The raw handle is destroyed
/// on drop, then the backing buffer.
pub struct AccelStruct {
    device: Device,
    buffer: Buffer,
    pub(crate) raw: vk::AccelerationStructureKHR,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    device_address: vk::DeviceAddress,
}

impl Drop for AccelStruct {
    fn drop(&mut self) {
        unsafe {
            self.device
                .accel_fns()
                .destroy_acceleration_structure(self.raw, None);
        }
    }
}
impl HasDevice for AccelStruct {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl AsVkHandle for AccelStruct {
    type Handle = vk::AccelerationStructureKHR;
    fn vk_handle(&self) -> Self::Handle {
        self.raw
    }
}

impl AccelStruct {
    /// Build flags the structure was created for.
    pub fn flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.flags
    }

    /// Device address referenced by instance records and descriptor writes.
    ///
    /// Valid for as long as this structure exists; instance records capture it
    /// by value, which is why referenced structures must outlive the top-level
    /// structure holding the record.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    /// Size of the backing storage in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }

    /// Creates an acceleration structure on an existing buffer.
    pub fn create_on_buffer(
        device: Device,
        buffer: Buffer,
        ty: vk::AccelerationStructureTypeKHR,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Result<Self> {
        unsafe {
            let raw = device.accel_fns().create_acceleration_structure(
                &vk::AccelerationStructureCreateInfoKHR {
                    ty,
                    size: buffer.size(),
                    offset: buffer.offset(),
                    buffer: buffer.vk_handle(),
                    ..Default::default()
                },
                None,
            )?;
            let device_address = device.accel_fns().get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR {
                    acceleration_structure: raw,
                    ..Default::default()
                },
            );
            Ok(Self {
                device,
                buffer,
                raw,
                flags,
                device_address,
            })
        }
    }

    /// Creates a new acceleration structure with freshly allocated storage.
    pub fn new(
        allocator: Allocator,
        size: vk::DeviceSize,
        ty: vk::AccelerationStructureTypeKHR,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Result<Self> {
        let what = if ty == vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL {
            "bottom-level index storage"
        } else {
            "top-level index storage"
        };
        let buffer = Buffer::new_private(
            allocator.clone(),
            size,
            1,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            what,
        )?;
        Self::create_on_buffer(allocator.device().clone(), buffer, ty, flags)
    }
}

/// Stable handle to a bottom-level structure inside a [`BlasSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlasId(pub(crate) u32);

pub(crate) struct BlasEntry {
    pub accel: Arc<AccelStruct>,
    /// Per-geometry primitive counts captured at build time. An update with
    /// different counts means the topology changed and a rebuild is required.
    pub primitive_counts: SmallVec<[u32; 1]>,
    pub update_scratch_size: vk::DeviceSize,
}

/// Arena of bottom-level acceleration structures keyed by [`BlasId`].
///
/// Cross-references from top-level instance records are device addresses, not
/// pointers; the arena plus `Arc` retention turn the spec's "top-level
/// destroyed before the bottom-level set it references" invariant into a
/// checkable rule instead of caller discipline.
#[derive(Default)]
pub struct BlasSet {
    slots: Slots<BlasEntry>,
}

impl BlasSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, entry: BlasEntry) -> BlasId {
        BlasId(self.slots.insert(entry))
    }

    pub fn get(&self, id: BlasId) -> Option<&Arc<AccelStruct>> {
        self.slots.get(id.0).map(|entry| &entry.accel)
    }

    pub(crate) fn entry(&self, id: BlasId) -> Result<&BlasEntry> {
        self.slots
            .get(id.0)
            .ok_or_else(|| Error::configuration(format!("unknown bottom-level index {id:?}")))
    }

    pub(crate) fn entry_mut(&mut self, id: BlasId) -> Result<&mut BlasEntry> {
        self.slots
            .get_mut(id.0)
            .ok_or_else(|| Error::configuration(format!("unknown bottom-level index {id:?}")))
    }

    /// Device address for instance records, resolved just-in-time at
    /// top-level build.
    pub fn address(&self, id: BlasId) -> Result<vk::DeviceAddress> {
        Ok(self.entry(id)?.accel.device_address())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.len() == 0
    }

    /// Removes and destroys a bottom-level structure.
    ///
    /// Fails with [`Error::ProtocolViolation`] while any top-level structure
    /// still retains it; destroying it anyway would leave a dangling device
    /// address inside live instance records.
    pub fn remove(&mut self, id: BlasId) -> Result<()> {
        let entry = self.entry(id)?;
        if is_externally_retained(&entry.accel) {
            tracing::error!(
                ?id,
                "attempted to destroy a bottom-level index still referenced by a top-level index"
            );
            return Err(Error::ProtocolViolation(
                "bottom-level index is still referenced by a top-level index; \
                 destroy or rebuild the top-level index first",
            ));
        }
        self.slots.remove(id.0);
        Ok(())
    }

    /// Swaps in replacement storage for `id`, returning the original.
    ///
    /// Used by compaction: the original is kept alive by any outstanding
    /// top-level retention and destroyed once the caller drops it.
    pub(crate) fn replace(&mut self, id: BlasId, accel: AccelStruct) -> Result<Arc<AccelStruct>> {
        let entry = self.entry_mut(id)?;
        Ok(std::mem::replace(&mut entry.accel, Arc::new(accel)))
    }
}

/// Whether anything outside the arena still holds the structure. The arena
/// owns one strong reference; every additional one is a top-level retention.
fn is_externally_retained<T>(accel: &Arc<T>) -> bool {
    Arc::strong_count(accel) > 1
}

/// Slot storage with free-list reuse.
pub(crate) struct Slots<T> {
    entries: Vec<Option<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> Slots<T> {
    pub fn insert(&mut self, value: T) -> u32 {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            self.entries[index as usize] = Some(value);
            index
        } else {
            self.entries.push(Some(value));
            (self.entries.len() - 1) as u32
        }
    }

    pub fn get(&self, index: u32) -> Option<&T> {
        self.entries.get(index as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        self.entries.get_mut(index as usize)?.as_mut()
    }

    pub fn remove(&mut self, index: u32) -> Option<T> {
        let value = self.entries.get_mut(index as usize)?.take();
        if value.is_some() {
            self.len -= 1;
            self.free.push(index);
        }
        value
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_insert_get_remove() {
        let mut slots = Slots::default();
        let a = slots.insert("a");
        let b = slots.insert("b");
        assert_eq!(slots.len(), 2);
        assert_eq!(slots.get(a), Some(&"a"));
        assert_eq!(slots.get(b), Some(&"b"));

        assert_eq!(slots.remove(a), Some("a"));
        assert_eq!(slots.get(a), None);
        assert_eq!(slots.remove(a), None);
        assert_eq!(slots.len(), 1);
    }

    #[test]
    fn test_slots_reuse_freed_indices() {
        let mut slots = Slots::default();
        let a = slots.insert(1);
        let _b = slots.insert(2);
        slots.remove(a);
        // Freed slot is reused before the vector grows.
        let c = slots.insert(3);
        assert_eq!(c, a);
        assert_eq!(slots.get(c), Some(&3));
    }

    #[test]
    fn test_outstanding_reference_detected() {
        // The removal guard `BlasSet::remove` runs, on a plain payload: a
        // second strong reference marks the entry as retained, dropping it
        // clears the mark.
        let held = Arc::new(42_u32);
        assert!(!is_externally_retained(&held));
        let retained = held.clone();
        assert!(is_externally_retained(&held));
        drop(retained);
        assert!(!is_externally_retained(&held));
    }
}
