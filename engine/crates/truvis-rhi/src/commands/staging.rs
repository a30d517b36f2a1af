use crate::allocator::MemoryBlock;
use crate::resource::handles::BufferHandle;

/// staging buffer 中的一段
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagingRegion {
    pub buffer: BufferHandle,
    /// 相对于 staging buffer 的偏移
    pub offset: u64,
    pub size: u64,
    pub memory: MemoryBlock,
}

#[derive(Debug)]
pub struct StagingChunk {
    pub buffer: BufferHandle,
    pub memory: MemoryBlock,
    pub size: u64,
    cursor: u64,
}

impl StagingChunk {
    pub fn new(buffer: BufferHandle, memory: MemoryBlock, size: u64) -> Self {
        Self {
            buffer,
            memory,
            size,
            cursor: 0,
        }
    }
}

/// 每个 FrameSlot 一个的线性 staging 分配器
///
/// chunk 是 host visible 的 buffer，只在槽位的 fence 完成之后整体 reset，
/// 因此写入 staging 时不需要等待 GPU。
#[derive(Debug)]
pub struct StagingBelt {
    chunks: Vec<StagingChunk>,
    chunk_size: u64,
    alignment: u64,
}
// new & init
impl StagingBelt {
    pub fn new(chunk_size: u64, alignment: u64) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self {
            chunks: Vec::new(),
            chunk_size,
            alignment,
        }
    }
}
// getters
impl StagingBelt {
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn used_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.cursor).sum()
    }

    pub fn capacity(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }

    /// 新 chunk 的大小，超过默认大小的上传单独一个 chunk
    #[inline]
    pub fn chunk_size_for(&self, size: u64) -> u64 {
        self.chunk_size.max(align_up(size, self.alignment))
    }
}
// tools
impl StagingBelt {
    /// 在已有的 chunk 中分配，放不下时返回 None，由调用者创建新的 chunk
    pub fn try_allocate(&mut self, size: u64) -> Option<StagingRegion> {
        let alignment = self.alignment;
        self.chunks.iter_mut().find_map(|chunk| {
            let offset = align_up(chunk.cursor, alignment);
            if offset + size > chunk.size {
                return None;
            }
            chunk.cursor = offset + size;
            Some(StagingRegion {
                buffer: chunk.buffer,
                offset,
                size,
                memory: chunk.memory,
            })
        })
    }

    pub fn add_chunk(&mut self, chunk: StagingChunk) {
        log::debug!("staging belt: new chunk {:?}, {} bytes", chunk.buffer, chunk.size);
        self.chunks.push(chunk);
    }

    /// 槽位的 fence 完成之后调用
    pub fn reset(&mut self) {
        for chunk in &mut self.chunks {
            chunk.cursor = 0;
        }
    }
}

#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeviceMemoryId;
    use crate::resource::desc::MemoryLocality;

    fn chunk(index: u32, size: u64) -> StagingChunk {
        let memory = MemoryBlock {
            locality: MemoryLocality::HostVisible,
            linear: true,
            memory: DeviceMemoryId(index as u64),
            offset: 0,
            size,
            class_size: size,
            dedicated: false,
        };
        StagingChunk::new(BufferHandle::from_raw_parts(index, 1), memory, size)
    }

    #[test]
    fn test_linear_allocation_with_alignment() {
        let mut belt = StagingBelt::new(256, 16);
        assert!(belt.try_allocate(10).is_none());
        belt.add_chunk(chunk(0, 256));

        let a = belt.try_allocate(10).unwrap();
        let b = belt.try_allocate(10).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 16);
        assert!(belt.try_allocate(240).is_none());
        assert_eq!(belt.used_bytes(), 26);

        belt.reset();
        assert_eq!(belt.try_allocate(256).unwrap().offset, 0);
    }

    #[test]
    fn test_large_upload_gets_own_chunk_size() {
        let belt = StagingBelt::new(256, 16);
        assert_eq!(belt.chunk_size_for(100), 256);
        assert_eq!(belt.chunk_size_for(1000), 1008);
    }
}
