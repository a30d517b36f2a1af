use std::collections::HashMap;

use crate::backend::{DeviceMemoryId, MemoryBinding};
use crate::error::{RhiError, RhiResult};
use crate::resource::desc::MemoryLocality;

struct Allocation {
    locality: MemoryLocality,
    /// 不计入预算（surface image 的内存）
    internal: bool,
    data: Vec<u8>,
}

/// 用 `Vec<u8>` 模拟的 device memory
pub(crate) struct MemoryStore {
    allocations: HashMap<DeviceMemoryId, Allocation>,
    used: [u64; 2],
    budgets: [u64; 2],
    next_id: u64,
}

#[inline]
fn locality_index(locality: MemoryLocality) -> usize {
    match locality {
        MemoryLocality::DeviceLocal => 0,
        MemoryLocality::HostVisible => 1,
    }
}

impl MemoryStore {
    pub fn new(device_local_budget: u64, host_visible_budget: u64) -> Self {
        Self {
            allocations: HashMap::new(),
            used: [0; 2],
            budgets: [device_local_budget, host_visible_budget],
            next_id: 1,
        }
    }

    pub fn allocate(&mut self, locality: MemoryLocality, size: u64, internal: bool) -> RhiResult<DeviceMemoryId> {
        let idx = locality_index(locality);
        let out_of_memory = || RhiError::OutOfDeviceMemory {
            locality,
            requested: size,
        };
        let used = self.used[idx].checked_add(size).filter(|&used| used <= self.budgets[idx]);
        if !internal && used.is_none() {
            return Err(out_of_memory());
        }

        // 内部分配不受预算限制，但宿主内存不足时同样报告 OutOfDeviceMemory
        let len = usize::try_from(size).map_err(|_| out_of_memory())?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| out_of_memory())?;
        data.resize(len, 0);

        if let (false, Some(used)) = (internal, used) {
            self.used[idx] = used;
        }
        let id = DeviceMemoryId(self.next_id);
        self.next_id += 1;
        self.allocations.insert(
            id,
            Allocation {
                locality,
                internal,
                data,
            },
        );
        Ok(id)
    }

    pub fn free(&mut self, memory: DeviceMemoryId) -> bool {
        match self.allocations.remove(&memory) {
            Some(allocation) => {
                if !allocation.internal {
                    self.used[locality_index(allocation.locality)] -= allocation.data.len() as u64;
                }
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn used(&self, locality: MemoryLocality) -> u64 {
        self.used[locality_index(locality)]
    }

    #[inline]
    pub fn allocation_count(&self) -> usize {
        self.allocations.values().filter(|a| !a.internal).count()
    }

    fn data(&self, memory: DeviceMemoryId) -> RhiResult<&Vec<u8>> {
        self.allocations
            .get(&memory)
            .map(|a| &a.data)
            .ok_or_else(|| RhiError::Backend(format!("unknown device memory {memory:?}")))
    }

    fn data_mut(&mut self, memory: DeviceMemoryId) -> RhiResult<&mut Vec<u8>> {
        self.allocations
            .get_mut(&memory)
            .map(|a| &mut a.data)
            .ok_or_else(|| RhiError::Backend(format!("unknown device memory {memory:?}")))
    }

    fn check_range(len: usize, offset: u64, size: u64) -> RhiResult<std::ops::Range<usize>> {
        let end = offset.checked_add(size);
        match end {
            Some(end) if end <= len as u64 => Ok(offset as usize..end as usize),
            _ => Err(RhiError::InvalidRange {
                offset,
                size,
                len: len as u64,
            }),
        }
    }

    pub fn write(&mut self, memory: DeviceMemoryId, offset: u64, bytes: &[u8]) -> RhiResult<()> {
        let data = self.data_mut(memory)?;
        let range = Self::check_range(data.len(), offset, bytes.len() as u64)?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read(&self, memory: DeviceMemoryId, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        let data = self.data(memory)?;
        let range = Self::check_range(data.len(), offset, out.len() as u64)?;
        out.copy_from_slice(&data[range]);
        Ok(())
    }

    /// 在两个绑定区间之间复制，区间内的 offset 相对于各自的绑定
    pub fn copy(
        &mut self,
        src: MemoryBinding,
        src_offset: u64,
        dst: MemoryBinding,
        dst_offset: u64,
        size: u64,
    ) -> RhiResult<()> {
        Self::check_range(src.size as usize, src_offset, size)?;
        Self::check_range(dst.size as usize, dst_offset, size)?;

        let mut staging = vec![0; size as usize];
        self.read(src.memory, src.offset + src_offset, &mut staging)?;
        self.write(dst.memory, dst.offset + dst_offset, &staging)
    }

    /// 用重复的 pattern 填充区间
    pub fn fill(&mut self, dst: MemoryBinding, offset: u64, size: u64, pattern: &[u8]) -> RhiResult<()> {
        Self::check_range(dst.size as usize, offset, size)?;
        let data = self.data_mut(dst.memory)?;
        let range = Self::check_range(data.len(), dst.offset + offset, size)?;
        for (byte, value) in data[range].iter_mut().zip(pattern.iter().cycle()) {
            *byte = *value;
        }
        Ok(())
    }
}
