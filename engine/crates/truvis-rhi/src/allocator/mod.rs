//! 资源内存的分配
//!
//! 每种 (locality, linear/optimal) 一个 pool，pool 由若干大的 backing block 组成，
//! block 内部用 buddy 分配器按 size class 划分。
//! 超过 backing block 大小的请求单独分配（dedicated）。
//!
//! 释放是延迟的：`free` 只是登记，`reclaim` 在对应的帧完成之后才真正归还。

pub mod buddy;

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use itertools::Itertools;

use crate::allocator::buddy::BuddyAllocator;
use crate::backend::{DeviceMemoryId, GfxBackend, MemoryBinding};
use crate::config::AllocatorConfig;
use crate::error::{RhiError, RhiResult};
use crate::frame::FrameIndex;
use crate::resource::desc::MemoryLocality;

/// 一次分配的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryBlock {
    pub locality: MemoryLocality,
    /// buffer 为 linear，image 为 optimal，两者不共享 backing block
    pub linear: bool,
    pub memory: DeviceMemoryId,
    pub offset: u64,
    /// 请求的大小
    pub size: u64,
    /// 实际占用的大小
    pub class_size: u64,
    pub dedicated: bool,
}

impl MemoryBlock {
    #[inline]
    pub fn binding(&self) -> MemoryBinding {
        MemoryBinding {
            memory: self.memory,
            offset: self.offset,
            size: self.size,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub backing_blocks: usize,
    pub dedicated_blocks: usize,
    /// 向后端申请的总字节数
    pub reserved_bytes: u64,
    /// 已经分配出去的字节数（按 size class 计）
    pub used_bytes: u64,
    pub pending_frees: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub blocks: usize,
    pub bytes: u64,
    pub released_backing_blocks: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct PoolKey {
    locality: MemoryLocality,
    linear: bool,
}

struct BackingBlock {
    memory: DeviceMemoryId,
    buddy: BuddyAllocator,
}

struct Pool {
    block_size: u64,
    blocks: Vec<BackingBlock>,
}

pub struct ResourceAllocator {
    backend: Arc<dyn GfxBackend>,
    config: AllocatorConfig,

    pools: IndexMap<PoolKey, Pool>,
    /// dedicated 分配：memory -> size
    dedicated: HashMap<DeviceMemoryId, u64>,

    /// 等待帧完成的释放请求，None 表示随时可以归还
    pending: Vec<(MemoryBlock, Option<FrameIndex>)>,
}
// new & init
impl ResourceAllocator {
    pub fn new(backend: Arc<dyn GfxBackend>, config: AllocatorConfig) -> Self {
        Self {
            backend,
            config,
            pools: IndexMap::new(),
            dedicated: HashMap::new(),
            pending: Vec::new(),
        }
    }

    fn block_size(&self, locality: MemoryLocality) -> u64 {
        match locality {
            MemoryLocality::DeviceLocal => self.config.device_local_block_size,
            MemoryLocality::HostVisible => self.config.host_visible_block_size,
        }
    }
}
// getters
impl ResourceAllocator {
    pub fn stats(&self) -> AllocatorStats {
        let mut stats = AllocatorStats {
            dedicated_blocks: self.dedicated.len(),
            pending_frees: self.pending.len(),
            ..Default::default()
        };
        for pool in self.pools.values() {
            stats.backing_blocks += pool.blocks.len();
            for block in &pool.blocks {
                stats.reserved_bytes += block.buddy.size();
                stats.used_bytes += block.buddy.used();
            }
        }
        for size in self.dedicated.values() {
            stats.reserved_bytes += size;
            stats.used_bytes += size;
        }
        stats
    }
}
// allocate & free
impl ResourceAllocator {
    /// 分配一块内存
    ///
    /// 所有 backing block 都放不下时向后端申请新的 block，后端失败时返回 `OutOfDeviceMemory`。
    pub fn allocate(
        &mut self,
        size: u64,
        alignment: u64,
        linear: bool,
        locality: MemoryLocality,
    ) -> RhiResult<MemoryBlock> {
        let _span = crate::rhi_span!("ResourceAllocator::allocate");
        let size = size.max(1);
        let alignment = alignment.max(1);
        let block_size = self.block_size(locality);
        let min_allocation = self.config.min_allocation;

        // 超出 u64 的 size class 一样交给 dedicated 分配，由后端报告内存不足
        let class_size = size.max(alignment).max(min_allocation).checked_next_power_of_two();
        if class_size.is_none_or(|class_size| class_size > block_size) {
            return self.allocate_dedicated(size, linear, locality);
        }

        let key = PoolKey { locality, linear };
        let pool = self.pools.entry(key).or_insert_with(|| Pool {
            block_size,
            blocks: Vec::new(),
        });

        for block in &mut pool.blocks {
            if let Some((offset, class_size)) = block.buddy.allocate(size, alignment) {
                return Ok(MemoryBlock {
                    locality,
                    linear,
                    memory: block.memory,
                    offset,
                    size,
                    class_size,
                    dedicated: false,
                });
            }
        }

        // 需要新的 backing block
        let memory = self.backend.allocate_memory(locality, pool.block_size).map_err(|e| match e {
            RhiError::OutOfDeviceMemory { .. } => RhiError::OutOfDeviceMemory {
                locality,
                requested: size,
            },
            other => other,
        })?;
        log::debug!(
            "allocator: new {:?} backing block {:?} ({} bytes, linear: {})",
            locality,
            memory,
            pool.block_size,
            linear
        );

        let mut buddy = BuddyAllocator::new(pool.block_size, min_allocation);
        let (offset, class_size) = buddy.allocate(size, alignment).ok_or(RhiError::OutOfDeviceMemory {
            locality,
            requested: size,
        })?;
        pool.blocks.push(BackingBlock { memory, buddy });

        Ok(MemoryBlock {
            locality,
            linear,
            memory,
            offset,
            size,
            class_size,
            dedicated: false,
        })
    }

    fn allocate_dedicated(&mut self, size: u64, linear: bool, locality: MemoryLocality) -> RhiResult<MemoryBlock> {
        let memory = self.backend.allocate_memory(locality, size)?;
        log::debug!("allocator: dedicated {:?} allocation {:?} ({} bytes)", locality, memory, size);
        self.dedicated.insert(memory, size);
        Ok(MemoryBlock {
            locality,
            linear,
            memory,
            offset: 0,
            size,
            class_size: size,
            dedicated: true,
        })
    }

    /// 登记一次释放，`safe_after` 这一帧完成之后才会真正归还
    ///
    /// `safe_after` 为 None 表示这块内存从未被 GPU 使用过。
    pub fn free(&mut self, block: MemoryBlock, safe_after: Option<FrameIndex>) {
        self.pending.push((block, safe_after));
    }

    /// 归还所有在 `completed` 之前（含）可以释放的内存
    pub fn reclaim(&mut self, completed: Option<FrameIndex>) -> ReclaimReport {
        let _span = crate::rhi_span!("ResourceAllocator::reclaim");
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(_, safe_after)| match (safe_after, completed) {
                (None, _) => true,
                (Some(frame), Some(completed)) => *frame <= completed,
                (Some(_), None) => false,
            });
        self.pending = waiting;

        let mut report = ReclaimReport::default();
        for (block, _) in ready {
            self.release_block(&block);
            report.blocks += 1;
            report.bytes += block.class_size;
        }
        if report.blocks > 0 && self.config.release_empty_blocks {
            report.released_backing_blocks = self.release_empty_blocks(true);
        }
        report
    }

    fn release_block(&mut self, block: &MemoryBlock) {
        if block.dedicated {
            if self.dedicated.remove(&block.memory).is_some() {
                self.backend.free_memory(block.memory);
            } else {
                log::error!("allocator: unknown dedicated allocation {:?}", block.memory);
            }
            return;
        }

        let key = PoolKey {
            locality: block.locality,
            linear: block.linear,
        };
        let freed = self
            .pools
            .get_mut(&key)
            .and_then(|pool| pool.blocks.iter_mut().find(|b| b.memory == block.memory))
            .and_then(|backing| backing.buddy.free(block.offset));
        if freed.is_none() {
            log::error!("allocator: double free or unknown block {:?}", block);
        }
    }

    /// 释放空的 backing block，`keep_one` 时每个 pool 保留一个空 block 供下次使用
    fn release_empty_blocks(&mut self, keep_one: bool) -> usize {
        let mut released = Vec::new();
        for pool in self.pools.values_mut() {
            let mut kept_empty = !keep_one;
            pool.blocks.retain(|block| {
                if !block.buddy.is_empty() {
                    return true;
                }
                if !kept_empty {
                    kept_empty = true;
                    return true;
                }
                released.push(block.memory);
                false
            });
        }
        for memory in &released {
            self.backend.free_memory(*memory);
        }
        if !released.is_empty() {
            log::debug!("allocator: released {} empty backing blocks", released.len());
        }
        released.len()
    }

    /// 归还所有空的 backing block
    pub fn free_unused(&mut self) -> usize {
        self.release_empty_blocks(false)
    }
}
// destroy
impl ResourceAllocator {
    /// 归还所有内存，只在 Device 销毁时调用
    pub fn destroy(&mut self) {
        let pending = self.pending.len();
        if pending > 0 {
            log::debug!("allocator: dropping {} pending frees on destroy", pending);
        }
        self.pending.clear();

        let memories = self
            .pools
            .drain(..)
            .flat_map(|(_, pool)| pool.blocks.into_iter().map(|b| b.memory))
            .chain(self.dedicated.drain().map(|(memory, _)| memory))
            .collect_vec();
        for memory in memories {
            self.backend.free_memory(memory);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessBackend, HeadlessConfig};

    fn allocator(config: AllocatorConfig) -> (Arc<HeadlessBackend>, ResourceAllocator) {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig::default()));
        let allocator = ResourceAllocator::new(backend.clone(), config);
        (backend, allocator)
    }

    fn small_config() -> AllocatorConfig {
        AllocatorConfig {
            device_local_block_size: 4096,
            host_visible_block_size: 1024,
            min_allocation: 256,
            release_empty_blocks: true,
        }
    }

    #[test]
    fn test_sub_allocation_shares_backing_block() {
        let (_backend, mut allocator) = allocator(small_config());
        let a = allocator.allocate(100, 16, true, MemoryLocality::DeviceLocal).unwrap();
        let b = allocator.allocate(300, 16, true, MemoryLocality::DeviceLocal).unwrap();
        assert_eq!(a.memory, b.memory);
        assert_eq!(a.class_size, 256);
        assert_eq!(b.class_size, 512);

        let stats = allocator.stats();
        assert_eq!(stats.backing_blocks, 1);
        assert_eq!(stats.used_bytes, 768);
        assert_eq!(stats.reserved_bytes, 4096);
    }

    #[test]
    fn test_linear_and_optimal_use_separate_pools() {
        let (_backend, mut allocator) = allocator(small_config());
        let buffer = allocator.allocate(256, 16, true, MemoryLocality::DeviceLocal).unwrap();
        let image = allocator.allocate(256, 16, false, MemoryLocality::DeviceLocal).unwrap();
        assert_ne!(buffer.memory, image.memory);
    }

    #[test]
    fn test_large_request_is_dedicated() {
        let (_backend, mut allocator) = allocator(small_config());
        let block = allocator.allocate(10_000, 16, true, MemoryLocality::DeviceLocal).unwrap();
        assert!(block.dedicated);
        assert_eq!(allocator.stats().dedicated_blocks, 1);

        allocator.free(block, None);
        allocator.reclaim(None);
        assert_eq!(allocator.stats().dedicated_blocks, 0);
    }

    #[test]
    fn test_free_is_deferred_until_frame_completes() {
        let (_backend, mut allocator) = allocator(small_config());
        let block = allocator.allocate(256, 16, true, MemoryLocality::HostVisible).unwrap();
        allocator.free(block, Some(FrameIndex(3)));

        assert_eq!(allocator.reclaim(None).blocks, 0);
        assert_eq!(allocator.reclaim(Some(FrameIndex(2))).blocks, 0);
        assert_eq!(allocator.stats().used_bytes, 256);

        let report = allocator.reclaim(Some(FrameIndex(3)));
        assert_eq!(report.blocks, 1);
        assert_eq!(report.bytes, 256);
        assert_eq!(allocator.stats().used_bytes, 0);
        assert_eq!(allocator.stats().pending_frees, 0);
    }

    #[test]
    fn test_grow_and_release_empty_blocks() {
        let (_backend, mut allocator) = allocator(small_config());
        let blocks: Vec<_> = (0..3)
            .map(|_| allocator.allocate(1024, 16, true, MemoryLocality::HostVisible).unwrap())
            .collect();
        assert_eq!(allocator.stats().backing_blocks, 3);

        for block in blocks {
            allocator.free(block, None);
        }
        let report = allocator.reclaim(None);
        assert_eq!(report.released_backing_blocks, 2);
        assert_eq!(allocator.stats().backing_blocks, 1);
        assert_eq!(allocator.free_unused(), 1);
        assert_eq!(allocator.stats().backing_blocks, 0);
    }

    #[test]
    fn test_out_of_device_memory() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig {
            device_local_budget: 4096,
            ..Default::default()
        }));
        let mut allocator = ResourceAllocator::new(backend, small_config());
        let _a = allocator.allocate(4096, 16, true, MemoryLocality::DeviceLocal).unwrap();
        let err = allocator.allocate(256, 16, true, MemoryLocality::DeviceLocal).unwrap_err();
        assert_eq!(
            err,
            RhiError::OutOfDeviceMemory {
                locality: MemoryLocality::DeviceLocal,
                requested: 256
            }
        );
        // 失败只影响这一次调用
        assert_eq!(allocator.stats().backing_blocks, 1);
    }
}
