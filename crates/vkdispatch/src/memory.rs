//! GPU buffers with dedicated, budget-checked memory.

use crate::budget::{MemoryBudget, Reservation};
use crate::context::Context;
use crate::descriptors::DescriptorResource;
use crate::error::{ComputeError, Result};
use crate::handle::Owned;
use ash::vk;
use std::cell::Cell;
use std::ffi::c_void;
use std::ptr::NonNull;

/// A memory type chosen for an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypeChoice {
    pub index: u32,
    pub heap_index: u32,
    /// Size of the heap backing this type; the budget is checked against it.
    pub heap_size: u64,
    pub property_flags: vk::MemoryPropertyFlags,
}

/// Find the first memory type allowed by `type_bits` whose flags contain `flags`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<MemoryTypeChoice> {
    memory_properties
        .memory_types
        .iter()
        .take(memory_properties.memory_type_count as usize)
        .enumerate()
        .find(|&(i, memory_type)| {
            type_bits & (1_u32 << i) != 0 && memory_type.property_flags.contains(flags)
        })
        .map(|(i, memory_type)| MemoryTypeChoice {
            index: i as u32,
            heap_index: memory_type.heap_index,
            heap_size: memory_properties.memory_heaps[memory_type.heap_index as usize].size,
            property_flags: memory_type.property_flags,
        })
}

/// Charge `requested` bytes against `capacity`, then allocate and bind.
///
/// `allocate` never runs when the charge would overflow. If `bind` fails the
/// allocation and the charge are both released before the error returns.
pub(crate) fn allocate_and_bind<'b, M>(
    budget: &'b MemoryBudget,
    requested: u64,
    capacity: u64,
    allocate: impl FnOnce() -> Result<M>,
    bind: impl FnOnce(&M) -> Result<()>,
) -> Result<(Reservation<'b>, M)> {
    let (reservation, memory) = budget.allocate_with(requested, capacity, allocate)?;
    bind(&memory)?;
    Ok((reservation, memory))
}

/// Parameters for [`Buffer::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    /// Requested size in bytes.
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub sharing_mode: vk::SharingMode,
    /// Shader binding slot.
    pub binding: u32,
    pub memory_flags: vk::MemoryPropertyFlags,
    pub descriptor_type: vk::DescriptorType,
}

impl BufferDesc {
    /// Host-visible, host-coherent storage buffer used exclusively by one queue family.
    pub fn storage(size: vk::DeviceSize, binding: u32) -> Self {
        Self {
            size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            binding,
            memory_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
        }
    }

    /// Same buffer bound as a uniform buffer.
    pub fn uniform(size: vk::DeviceSize, binding: u32) -> Self {
        Self {
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            ..Self::storage(size, binding)
        }
    }

    /// Reject descriptions the driver would refuse or misuse.
    ///
    /// Buffers are created for the context's single queue family, so only
    /// `EXCLUSIVE` sharing is accepted.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(ComputeError::Config("buffer size must be non-zero".into()));
        }
        if self.sharing_mode != vk::SharingMode::EXCLUSIVE {
            return Err(ComputeError::Config(format!(
                "sharing mode {:?} needs several queue families; only EXCLUSIVE is supported",
                self.sharing_mode
            )));
        }
        Ok(())
    }
}

/// A buffer bound to its own device memory allocation at offset 0.
pub struct Buffer<'a> {
    // Field order is drop order: reservation, memory, buffer.
    reservation: Reservation<'a>,
    memory: Owned<'a, vk::DeviceMemory>,
    buffer: Owned<'a, vk::Buffer>,
    desc: BufferDesc,
    memory_type: MemoryTypeChoice,
    mapped: Cell<bool>,
}

impl<'a> Buffer<'a> {
    /// Create a buffer, pick a memory type, charge the budget, allocate and bind.
    pub fn new(context: &'a Context, desc: &BufferDesc) -> Result<Self> {
        desc.validate()?;

        let device = context.device();
        let queue_family_indices = [context.queue_family_index()];

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(desc.sharing_mode)
            .queue_family_indices(&queue_family_indices);

        let buffer = unsafe {
            let raw = device
                .create_buffer(&buffer_info, None)
                .map_err(ComputeError::BufferCreation)?;
            Owned::new(device, raw)
        };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer.raw()) };

        let memory_type = find_memory_type(
            context.memory_properties(),
            requirements.memory_type_bits,
            desc.memory_flags,
        )
        .ok_or(ComputeError::NoMemoryType(desc.memory_flags))?;

        let (reservation, memory) = allocate_and_bind(
            context.budget(),
            requirements.size,
            memory_type.heap_size,
            || {
                let allocate_info = vk::MemoryAllocateInfo::default()
                    .allocation_size(requirements.size)
                    .memory_type_index(memory_type.index);
                unsafe {
                    let raw = device
                        .allocate_memory(&allocate_info, None)
                        .map_err(ComputeError::MemoryAllocation)?;
                    Ok(Owned::new(device, raw))
                }
            },
            |memory| unsafe {
                device
                    .bind_buffer_memory(buffer.raw(), memory.raw(), 0)
                    .map_err(ComputeError::MemoryAllocation)
            },
        )?;

        tracing::debug!(
            "Buffer at binding {} allocated: {} bytes ({} required) in memory type {} (heap {}), {} bytes in use",
            desc.binding,
            desc.size,
            requirements.size,
            memory_type.index,
            memory_type.heap_index,
            context.budget().allocated()
        );

        Ok(Self {
            reservation,
            memory,
            buffer,
            desc: *desc,
            memory_type,
            mapped: Cell::new(false),
        })
    }

    /// Shader binding slot.
    pub fn binding(&self) -> u32 {
        self.desc.binding
    }

    /// Descriptor kind this buffer is bound as.
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        self.desc.descriptor_type
    }

    /// Requested size in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.desc.size
    }

    /// Size actually allocated (may exceed [`Self::size`]).
    pub fn allocation_size(&self) -> vk::DeviceSize {
        self.reservation.bytes()
    }

    /// Raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.raw()
    }

    /// Raw memory handle.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory.raw()
    }

    /// Memory type the allocation lives in.
    pub fn memory_type(&self) -> &MemoryTypeChoice {
        &self.memory_type
    }

    /// Map the whole buffer and return the host pointer.
    ///
    /// The pointer stays valid until [`Self::unmap`] is called or the buffer
    /// is dropped. Host writes to non-coherent memory need an explicit flush;
    /// [`Self::map`] handles that.
    pub fn map_raw(&self) -> Result<NonNull<c_void>> {
        if !self
            .memory_type
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            return Err(ComputeError::MapFailed(format!(
                "memory type {} is not host-visible",
                self.memory_type.index
            )));
        }
        if self.mapped.get() {
            return Err(ComputeError::MapFailed(format!(
                "buffer at binding {} is already mapped",
                self.desc.binding
            )));
        }

        let ptr = unsafe {
            self.memory
                .device()
                .map_memory(
                    self.memory.raw(),
                    0,
                    vk::WHOLE_SIZE,
                    vk::MemoryMapFlags::empty(),
                )
                .map_err(|e| ComputeError::MapFailed(e.to_string()))?
        };

        let ptr = NonNull::new(ptr)
            .ok_or_else(|| ComputeError::MapFailed("driver returned a null pointer".into()))?;
        self.mapped.set(true);
        Ok(ptr)
    }

    /// Release a mapping obtained from [`Self::map_raw`]. No-op if unmapped.
    pub fn unmap(&self) {
        if self.mapped.replace(false) {
            unsafe { self.memory.device().unmap_memory(self.memory.raw()) };
        }
    }

    /// Map the buffer for the lifetime of the returned guard.
    pub fn map(&self) -> Result<MappedMemory<'_, 'a>> {
        let ptr = self.map_raw()?;
        let mapping = MappedMemory {
            buffer: self,
            ptr: ptr.cast(),
        };
        mapping.invalidate()?;
        Ok(mapping)
    }

    fn is_coherent(&self) -> bool {
        self.memory_type
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    fn whole_range(&self) -> vk::MappedMemoryRange<'static> {
        vk::MappedMemoryRange::default()
            .memory(self.memory.raw())
            .offset(0)
            .size(vk::WHOLE_SIZE)
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        self.unmap();
    }
}

impl DescriptorResource for Buffer<'_> {
    fn binding(&self) -> u32 {
        self.desc.binding
    }

    fn descriptor_type(&self) -> vk::DescriptorType {
        self.desc.descriptor_type
    }

    fn buffer(&self) -> vk::Buffer {
        self.buffer.raw()
    }

    fn byte_size(&self) -> vk::DeviceSize {
        self.desc.size
    }
}

/// Scoped host mapping of a [`Buffer`]; unmaps on drop.
pub struct MappedMemory<'b, 'a> {
    buffer: &'b Buffer<'a>,
    ptr: NonNull<u8>,
}

impl MappedMemory<'_, '_> {
    /// The mapped bytes (requested size, not the padded allocation).
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.buffer.size() as usize) }
    }

    /// The mapped bytes, writable.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.buffer.size() as usize) }
    }

    /// Copy out as many whole `T` as fit in the buffer.
    pub fn read<T: bytemuck::Pod>(&self) -> Vec<T> {
        decode_pod(self.as_bytes())
    }

    /// Write `data` at the start of the buffer.
    pub fn write<T: bytemuck::Pod>(&mut self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Write raw bytes at `offset`.
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.buffer.size() as usize)
            .ok_or_else(|| {
                ComputeError::MapFailed(format!(
                    "write of {} bytes at offset {offset} exceeds buffer size {}",
                    data.len(),
                    self.buffer.size()
                ))
            })?;

        self.as_bytes_mut()[offset..end].copy_from_slice(data);
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        if !self.buffer.is_coherent() {
            unsafe {
                self.buffer
                    .memory
                    .device()
                    .flush_mapped_memory_ranges(&[self.buffer.whole_range()])?;
            }
        }
        Ok(())
    }

    fn invalidate(&self) -> Result<()> {
        if !self.buffer.is_coherent() {
            unsafe {
                self.buffer
                    .memory
                    .device()
                    .invalidate_mapped_memory_ranges(&[self.buffer.whole_range()])?;
            }
        }
        Ok(())
    }
}

/// Decode whole `T` values from unaligned bytes, dropping any trailing partial value.
fn decode_pod<T: bytemuck::Pod>(bytes: &[u8]) -> Vec<T> {
    let size = std::mem::size_of::<T>();
    if size == 0 {
        return Vec::new();
    }
    bytes
        .chunks_exact(size)
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

impl Drop for MappedMemory<'_, '_> {
    fn drop(&mut self) {
        self.buffer.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(
        types: &[(vk::MemoryPropertyFlags, u32)],
        heaps: &[u64],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            memory_heap_count: heaps.len() as u32,
            ..Default::default()
        };
        for (slot, &(flags, heap_index)) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
            slot.heap_index = heap_index;
        }
        for (slot, &size) in props.memory_heaps.iter_mut().zip(heaps) {
            slot.size = size;
        }
        props
    }

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
            | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    );

    #[test]
    fn first_superset_type_reports_its_own_heap() {
        let props = memory_properties(
            &[
                (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
                (vk::MemoryPropertyFlags::HOST_VISIBLE, 1),
                (HOST | vk::MemoryPropertyFlags::HOST_CACHED, 2),
                (HOST, 1),
            ],
            &[8 << 30, 256 << 20, 16 << 30],
        );

        let choice = find_memory_type(&props, u32::MAX, HOST).unwrap();
        assert_eq!(choice.index, 2);
        assert_eq!(choice.heap_index, 2);
        assert_eq!(choice.heap_size, 16 << 30);
        assert!(choice
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_CACHED));
    }

    #[test]
    fn partial_flag_overlap_is_not_enough() {
        let props = memory_properties(
            &[
                (vk::MemoryPropertyFlags::HOST_VISIBLE, 0),
                (vk::MemoryPropertyFlags::HOST_COHERENT, 0),
            ],
            &[1024],
        );
        assert_eq!(find_memory_type(&props, u32::MAX, HOST), None);
    }

    #[test]
    fn requirement_bits_exclude_types() {
        let props = memory_properties(&[(HOST, 0), (HOST, 1)], &[1024, 4096]);

        let choice = find_memory_type(&props, 0b10, HOST).unwrap();
        assert_eq!(choice.index, 1);
        assert_eq!(choice.heap_size, 4096);
        assert_eq!(find_memory_type(&props, 0, HOST), None);
    }

    #[test]
    fn types_past_count_are_ignored() {
        let mut props = memory_properties(&[(vk::MemoryPropertyFlags::DEVICE_LOCAL, 0)], &[1024]);
        props.memory_types[1].property_flags = HOST;
        assert_eq!(find_memory_type(&props, u32::MAX, HOST), None);
    }

    #[test]
    fn storage_desc_defaults() {
        let desc = BufferDesc::storage(2052, 0);
        assert_eq!(desc.usage, vk::BufferUsageFlags::STORAGE_BUFFER);
        assert_eq!(desc.sharing_mode, vk::SharingMode::EXCLUSIVE);
        assert_eq!(desc.memory_flags, HOST);
        assert_eq!(desc.descriptor_type, vk::DescriptorType::STORAGE_BUFFER);

        let uniform = BufferDesc::uniform(64, 3);
        assert_eq!(uniform.binding, 3);
        assert_eq!(uniform.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(uniform.memory_flags, HOST);
    }

    #[test]
    fn zero_size_and_concurrent_sharing_are_rejected() {
        assert!(BufferDesc::storage(16, 0).validate().is_ok());
        assert!(matches!(
            BufferDesc::storage(0, 0).validate(),
            Err(ComputeError::Config(_))
        ));

        let concurrent = BufferDesc {
            sharing_mode: vk::SharingMode::CONCURRENT,
            ..BufferDesc::storage(16, 0)
        };
        assert!(matches!(concurrent.validate(), Err(ComputeError::Config(_))));
    }

    struct FakeMemory<'c> {
        freed: &'c Cell<u32>,
    }

    impl Drop for FakeMemory<'_> {
        fn drop(&mut self) {
            self.freed.set(self.freed.get() + 1);
        }
    }

    #[test]
    fn overflowing_buffer_never_reaches_the_allocator() {
        let budget = MemoryBudget::new();
        let allocations = Cell::new(0);
        let freed = Cell::new(0);
        let allocate = || {
            allocations.set(allocations.get() + 1);
            Ok(FakeMemory { freed: &freed })
        };

        let first = allocate_and_bind(&budget, 600, 1024, allocate, |_| Ok(())).unwrap();
        let second = allocate_and_bind(&budget, 600, 1024, allocate, |_| Ok(()));

        assert!(matches!(
            second,
            Err(ComputeError::OutOfMemory { overage: 176, .. })
        ));
        assert_eq!(allocations.get(), 1);
        assert_eq!(budget.allocated(), 600);

        drop(first);
        assert_eq!(freed.get(), 1);
        assert_eq!(budget.allocated(), 0);
    }

    #[test]
    fn failed_bind_releases_memory_and_charge() {
        let budget = MemoryBudget::new();
        let freed = Cell::new(0);

        let result = allocate_and_bind(
            &budget,
            256,
            1024,
            || Ok(FakeMemory { freed: &freed }),
            |_| Err(ComputeError::MemoryAllocation(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)),
        );

        assert!(matches!(result, Err(ComputeError::MemoryAllocation(_))));
        assert_eq!(freed.get(), 1);
        assert_eq!(budget.allocated(), 0);
    }

    #[test]
    fn pod_decoding_drops_partial_tail() {
        let bytes = [1_u8, 0, 0, 0, 2, 0, 0, 0, 9, 9];
        assert_eq!(decode_pod::<u32>(&bytes), vec![1, 2]);
        assert_eq!(decode_pod::<u8>(&bytes).len(), 10);
        assert_eq!(decode_pod::<u32>(&bytes[1..5]), vec![u32::from_le_bytes([0, 0, 0, 2])]);
    }

    #[test]
    fn zero_sized_pod_decodes_to_nothing() {
        assert!(decode_pod::<()>(&[1, 2, 3]).is_empty());
    }
}
