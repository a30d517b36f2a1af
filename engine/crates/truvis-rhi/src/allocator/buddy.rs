use std::collections::{BTreeSet, HashMap};

/// 一个 backing block 内部的 buddy 分配器
///
/// size class 都是 2 的幂，每个 class 一个 free list。
/// 每个子块的 offset 都按它自己的大小对齐，因此对齐要求只需要体现在 size class 上。
#[derive(Debug)]
pub struct BuddyAllocator {
    size: u64,
    min_size: u64,
    max_order: u32,

    /// free_lists[order] 中是大小为 `min_size << order` 的空闲块的 offset
    free_lists: Vec<BTreeSet<u64>>,
    /// 已分配的块：offset -> order
    allocated: HashMap<u64, u32>,
    used: u64,
}
// new & init
impl BuddyAllocator {
    /// size 和 min_size 都必须是 2 的幂
    pub fn new(size: u64, min_size: u64) -> Self {
        debug_assert!(size.is_power_of_two() && min_size.is_power_of_two() && min_size <= size);
        let max_order = (size / min_size).trailing_zeros();
        let mut free_lists = vec![BTreeSet::new(); max_order as usize + 1];
        free_lists[max_order as usize].insert(0);
        Self {
            size,
            min_size,
            max_order,
            free_lists,
            allocated: HashMap::new(),
            used: 0,
        }
    }
}
// getters
impl BuddyAllocator {
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn used(&self) -> u64 {
        self.used
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty()
    }

    /// 能够满足的最大请求
    pub fn largest_free(&self) -> u64 {
        self.free_lists
            .iter()
            .enumerate()
            .rev()
            .find(|(_, list)| !list.is_empty())
            .map_or(0, |(order, _)| self.min_size << order)
    }
}
// tools
impl BuddyAllocator {
    /// 请求对应的 size class，超出 u64 时返回 None
    #[inline]
    pub fn class_size(&self, size: u64, alignment: u64) -> Option<u64> {
        size.max(alignment).max(self.min_size).checked_next_power_of_two()
    }

    #[inline]
    fn order_of(&self, class_size: u64) -> u32 {
        (class_size / self.min_size).trailing_zeros()
    }

    /// 返回 (offset, class_size)，空间不足时返回 None
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<(u64, u64)> {
        let class_size = self.class_size(size, alignment)?;
        if class_size > self.size {
            return None;
        }
        let order = self.order_of(class_size);

        let found = (order..=self.max_order).find(|&o| !self.free_lists[o as usize].is_empty())?;
        let offset = self.free_lists[found as usize].pop_first()?;

        // 逐级拆分，右半部分放回 free list
        let mut current = found;
        while current > order {
            current -= 1;
            let buddy = offset + (self.min_size << current);
            self.free_lists[current as usize].insert(buddy);
        }

        self.allocated.insert(offset, order);
        self.used += class_size;
        Some((offset, class_size))
    }

    /// 释放并和 buddy 合并，返回释放的 class size
    pub fn free(&mut self, offset: u64) -> Option<u64> {
        let order = self.allocated.remove(&offset)?;
        let class_size = self.min_size << order;
        self.used -= class_size;

        let mut offset = offset;
        let mut order = order;
        while order < self.max_order {
            let buddy = offset ^ (self.min_size << order);
            if !self.free_lists[order as usize].remove(&buddy) {
                break;
            }
            offset = offset.min(buddy);
            order += 1;
        }
        self.free_lists[order as usize].insert(offset);
        Some(class_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_coalesce() {
        let mut buddy = BuddyAllocator::new(1024, 64);
        let (a, a_size) = buddy.allocate(100, 1).unwrap();
        let (b, b_size) = buddy.allocate(64, 1).unwrap();
        assert_eq!((a, a_size), (0, 128));
        assert_eq!((b, b_size), (128, 64));
        assert_eq!(buddy.used(), 192);
        assert_eq!(buddy.largest_free(), 512);

        assert_eq!(buddy.free(a), Some(128));
        assert_eq!(buddy.free(b), Some(64));
        assert!(buddy.is_empty());
        assert_eq!(buddy.largest_free(), 1024);
    }

    #[test]
    fn test_alignment_raises_class() {
        let mut buddy = BuddyAllocator::new(4096, 64);
        let (_, first) = buddy.allocate(64, 1).unwrap();
        let (offset, class) = buddy.allocate(64, 1024).unwrap();
        assert_eq!(first, 64);
        assert_eq!(class, 1024);
        assert_eq!(offset % 1024, 0);
    }

    #[test]
    fn test_exhaustion() {
        let mut buddy = BuddyAllocator::new(256, 64);
        for _ in 0..4 {
            assert!(buddy.allocate(64, 1).is_some());
        }
        assert!(buddy.allocate(64, 1).is_none());
        assert!(buddy.allocate(512, 1).is_none());
        // size class 超出 u64
        assert!(buddy.allocate(u64::MAX / 2 + 2, 1).is_none());
        assert_eq!(buddy.free(12345), None);
    }
}
