use std::collections::HashMap;
use std::ptr::NonNull;

use ash::vk;
use truvis_rhi::backend::DeviceMemoryId;
use truvis_rhi::resource::desc::MemoryLocality;
use truvis_rhi::{RhiError, RhiResult};

use crate::convert::vk_error;
use crate::physical_device::VulkanPhysicalDevice;

/// host visible 内存在分配时就 map，直到释放
pub(crate) struct MappedPtr(NonNull<u8>);

// map 出来的地址只在持有 MemoryPool 的锁时访问
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

pub(crate) struct VulkanMemory {
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) locality: MemoryLocality,
    pub(crate) size: u64,
    mapped: Option<MappedPtr>,
}

#[derive(Clone, Copy, Debug)]
struct MemoryType {
    index: u32,
    heap_size: u64,
}

/// vkAllocateMemory 的一层包装，每次分配是 RHI allocator 的一个 backing block
pub(crate) struct MemoryPool {
    allocations: HashMap<DeviceMemoryId, VulkanMemory>,
    next_id: u64,

    device_local: MemoryType,
    host_visible: MemoryType,
    used: [u64; 2],
}

// new & init
impl MemoryPool {
    pub(crate) fn new(pdevice: &VulkanPhysicalDevice) -> RhiResult<Self> {
        let (index, heap_size) = pdevice
            .find_memory_type(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .ok_or_else(|| RhiError::Backend("no device local memory type".into()))?;
        let device_local = MemoryType { index, heap_size };

        let (index, heap_size) = pdevice
            .find_memory_type(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT)
            .ok_or_else(|| RhiError::Backend("no host visible and coherent memory type".into()))?;
        let host_visible = MemoryType { index, heap_size };
        log::info!("memory types: device local {:?}, host visible {:?}", device_local, host_visible);

        Ok(Self {
            allocations: HashMap::new(),
            next_id: 1,
            device_local,
            host_visible,
            used: [0; 2],
        })
    }
}
// getters
impl MemoryPool {
    #[inline]
    fn memory_type(&self, locality: MemoryLocality) -> MemoryType {
        match locality {
            MemoryLocality::DeviceLocal => self.device_local,
            MemoryLocality::HostVisible => self.host_visible,
        }
    }

    #[inline]
    pub(crate) fn type_index(&self, locality: MemoryLocality) -> u32 {
        self.memory_type(locality).index
    }

    #[inline]
    pub(crate) fn heap_size(&self, locality: MemoryLocality) -> u64 {
        self.memory_type(locality).heap_size
    }

    #[inline]
    pub(crate) fn get(&self, id: DeviceMemoryId) -> Option<&VulkanMemory> {
        self.allocations.get(&id)
    }
}
// tools
impl MemoryPool {
    pub(crate) fn allocate(&mut self, device: &ash::Device, locality: MemoryLocality, size: u64) -> RhiResult<DeviceMemoryId> {
        let ty = self.memory_type(locality);
        let slot = locality as usize;
        if self.used[slot] + size > ty.heap_size {
            return Err(RhiError::OutOfDeviceMemory {
                locality,
                requested: size,
            });
        }

        let alloc_info = vk::MemoryAllocateInfo::default().allocation_size(size).memory_type_index(ty.index);
        let memory = unsafe { device.allocate_memory(&alloc_info, None) }.map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                RhiError::OutOfDeviceMemory {
                    locality,
                    requested: size,
                }
            }
            e => vk_error("allocate memory", e),
        })?;

        let mapped = match locality {
            MemoryLocality::DeviceLocal => None,
            MemoryLocality::HostVisible => {
                let ptr = unsafe { device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) };
                match ptr.map(|p| NonNull::new(p.cast::<u8>())) {
                    Ok(Some(ptr)) => Some(MappedPtr(ptr)),
                    Ok(None) => {
                        unsafe { device.free_memory(memory, None) };
                        return Err(RhiError::Backend("map memory returned null".into()));
                    }
                    Err(e) => {
                        unsafe { device.free_memory(memory, None) };
                        return Err(vk_error("map memory", e));
                    }
                }
            }
        };

        let id = DeviceMemoryId(self.next_id);
        self.next_id += 1;
        self.used[slot] += size;
        self.allocations.insert(
            id,
            VulkanMemory {
                memory,
                locality,
                size,
                mapped,
            },
        );
        log::debug!("allocate {:?} memory {:?}: {} bytes", locality, id, size);
        Ok(id)
    }

    /// 返回 false 表示 id 不存在
    pub(crate) fn free(&mut self, device: &ash::Device, id: DeviceMemoryId) -> bool {
        let Some(allocation) = self.allocations.remove(&id) else {
            return false;
        };
        self.used[allocation.locality as usize] -= allocation.size;
        unsafe {
            if allocation.mapped.is_some() {
                device.unmap_memory(allocation.memory);
            }
            device.free_memory(allocation.memory, None);
        }
        true
    }

    fn mapped_range(&self, id: DeviceMemoryId, offset: u64, len: usize) -> RhiResult<NonNull<u8>> {
        let allocation = self
            .allocations
            .get(&id)
            .ok_or_else(|| RhiError::Backend(format!("unknown memory {id:?}")))?;
        let Some(mapped) = &allocation.mapped else {
            return Err(RhiError::NotHostVisible);
        };
        if offset.checked_add(len as u64).is_none_or(|end| end > allocation.size) {
            return Err(RhiError::InvalidRange {
                offset,
                size: len as u64,
                len: allocation.size,
            });
        }
        // offset 已经检查过不会越界
        Ok(unsafe { mapped.0.add(offset as usize) })
    }

    pub(crate) fn write(&self, id: DeviceMemoryId, offset: u64, data: &[u8]) -> RhiResult<()> {
        let dst = self.mapped_range(id, offset, data.len())?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len()) };
        Ok(())
    }

    pub(crate) fn read(&self, id: DeviceMemoryId, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        let src = self.mapped_range(id, offset, out.len())?;
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), out.as_mut_ptr(), out.len()) };
        Ok(())
    }
}
// destroy
impl MemoryPool {
    pub(crate) fn destroy(&mut self, device: &ash::Device) {
        if !self.allocations.is_empty() {
            log::warn!("{} device memory allocations are still alive", self.allocations.len());
        }
        let ids: Vec<_> = self.allocations.keys().copied().collect();
        for id in ids {
            self.free(device, id);
        }
    }
}
