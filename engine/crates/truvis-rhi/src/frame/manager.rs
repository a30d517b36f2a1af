use std::time::Duration;

use crate::backend::GfxBackend;
use crate::commands::staging::StagingBelt;
use crate::commands::stream::CommandPool;
use crate::config::RhiConfig;
use crate::error::{RhiError, RhiResult};
use crate::frame::{Fence, FrameCounter, FrameIndex};
use crate::queue::QueueKind;
use crate::resource::handles::RawHandle;

/// 一个槽位持有的每帧资源
#[derive(Debug)]
pub struct FrameResources {
    pub staging: StagingBelt,
    /// 可以被新的 recorder 使用的 pool
    free_pools: Vec<CommandPool>,
    /// 已经随着这一帧提交、等待 fence 的 pool
    submitted_pools: Vec<CommandPool>,
    /// 这一帧的临时 descriptor set，提交时标记销毁
    transient: Vec<RawHandle>,
}

impl FrameResources {
    fn new(config: &RhiConfig) -> Self {
        Self {
            staging: StagingBelt::new(config.staging.chunk_size, config.staging.alignment),
            free_pools: Vec::new(),
            submitted_pools: Vec::new(),
            transient: Vec::new(),
        }
    }

    /// 槽位的 fence 完成之后调用
    fn reset(&mut self) {
        self.free_pools.append(&mut self.submitted_pools);
        self.staging.reset();
        self.transient.clear();
    }
}

/// N 个环形槽位中的一个
#[derive(Debug)]
pub struct FrameSlot {
    index: usize,
    /// 最近一次提交的 fence，None 表示没有在飞的工作
    fence: Option<Fence>,
    /// 最近一次使用这个槽位的帧
    last_frame: Option<FrameIndex>,
    resources: FrameResources,
}

impl FrameSlot {
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn fence(&self) -> Option<&Fence> {
        self.fence.as_ref()
    }

    #[inline]
    pub fn last_frame(&self) -> Option<FrameIndex> {
        self.last_frame
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.fence.as_ref().is_none_or(|f| f.is_signaled())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameStats {
    pub frames_begun: u64,
    pub frames_submitted: u64,
    /// 观察到的最大在飞帧数
    pub max_in_flight: usize,
    pub fence_timeouts: u64,
    /// begin_frame 中等待 fence 的总时间
    pub total_stall: Duration,
}

/// retire_completed 的结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetireReport {
    /// 已经完成的最新一帧
    pub completed: Option<FrameIndex>,
    pub resources_reclaimed: usize,
    pub memory_blocks_reclaimed: usize,
    pub bytes_reclaimed: u64,
}

impl RetireReport {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.resources_reclaimed == 0 && self.memory_blocks_reclaimed == 0
    }
}

/// 管理 N 个在飞的帧
///
/// - begin: 等待槽位上一次的 fence（有上限的等待），这是 CPU 和 GPU 之间唯一的反压点
/// - submit: 把这一帧的 fence 挂到槽位上
/// - 完成水位线按帧的顺序前进，遇到第一个没有完成的帧就停止
pub struct FrameManager {
    counter: FrameCounter,
    slots: Vec<FrameSlot>,

    /// 已经 begin 但是还没有 submit 的帧
    open: Option<FrameIndex>,
    last_submitted: Option<FrameIndex>,
    completed: Option<FrameIndex>,

    fence_timeout: Duration,
    stats: FrameStats,
}
// new & init
impl FrameManager {
    pub fn new(config: &RhiConfig) -> Self {
        let fif_count = config.frames.frames_in_flight;
        let slots = (0..fif_count)
            .map(|index| FrameSlot {
                index,
                fence: None,
                last_frame: None,
                resources: FrameResources::new(config),
            })
            .collect();
        Self {
            counter: FrameCounter::new(FrameIndex(0), fif_count),
            slots,
            open: None,
            last_submitted: None,
            completed: None,
            fence_timeout: config.fence_timeout(),
            stats: FrameStats::default(),
        }
    }
}
// getters
impl FrameManager {
    #[inline]
    pub fn fence_timeout(&self) -> Duration {
        self.fence_timeout
    }

    #[inline]
    pub fn fif_count(&self) -> usize {
        self.counter.fif_count()
    }

    #[inline]
    pub fn open_frame(&self) -> Option<FrameIndex> {
        self.open
    }

    #[inline]
    pub fn last_submitted(&self) -> Option<FrameIndex> {
        self.last_submitted
    }

    #[inline]
    pub fn completed(&self) -> Option<FrameIndex> {
        self.completed
    }

    #[inline]
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    #[inline]
    pub fn frame_name(&self, frame: FrameIndex) -> String {
        self.counter.frame_name(frame)
    }

    #[inline]
    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    /// 已经提交但是还没有完成的帧数
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_idle()).count()
    }

    pub fn fences(&self) -> impl Iterator<Item = &Fence> {
        self.slots.iter().filter_map(|s| s.fence.as_ref())
    }

    /// 检查 frame 是不是当前正在录制的帧
    #[inline]
    pub fn ensure_open(&self, frame: FrameIndex) -> RhiResult<()> {
        if self.open == Some(frame) { Ok(()) } else { Err(RhiError::FrameNotActive(frame)) }
    }

    #[inline]
    fn slot_mut(&mut self, frame: FrameIndex) -> &mut FrameSlot {
        let index = frame.slot(self.fif_count());
        &mut self.slots[index]
    }
}
// begin
impl FrameManager {
    /// 下一帧的序号，以及打开它之前需要等待的 fence；槽位空闲时 fence 为 None
    ///
    /// 上一帧还没有提交时返回 `FrameNotSubmitted`。
    pub fn next_slot(&self) -> RhiResult<(FrameIndex, Option<Fence>)> {
        if let Some(open) = self.open {
            return Err(RhiError::FrameNotSubmitted(open));
        }
        let frame = self.counter.peek();
        let fence = self.slots[frame.slot(self.fif_count())]
            .fence
            .as_ref()
            .filter(|fence| !fence.is_signaled())
            .cloned();
        Ok((frame, fence))
    }

    /// 登记一次在锁外进行的槽位等待，没有等到时返回 `FenceTimeout`
    pub fn record_slot_wait(&mut self, fence: &Fence, stall: Duration, signaled: bool) -> RhiResult<()> {
        self.stats.total_stall += stall;
        if signaled {
            return Ok(());
        }
        self.stats.fence_timeouts += 1;
        log::warn!("timed out waiting for {} after {:?}", fence.frame(), self.fence_timeout);
        Err(RhiError::FenceTimeout {
            frame: fence.frame(),
            timeout_ms: self.fence_timeout.as_millis() as u64,
        })
    }

    /// 打开 frame：回收槽位的资源，让后端重置槽位的 command pool
    ///
    /// 调用之前 `next_slot` 必须已经不再返回 fence。
    pub fn begin(&mut self, frame: FrameIndex, backend: &dyn GfxBackend) -> RhiResult<()> {
        debug_assert_eq!(frame, self.counter.peek());
        let slot = self.slot_mut(frame);
        debug_assert!(slot.is_idle(), "frame slot {} reused while in flight", slot.index);

        slot.resources.reset();
        backend.reset_command_pools(slot.index)?;
        slot.fence = None;
        slot.last_frame = Some(frame);

        self.counter.advance();
        self.open = Some(frame);
        self.stats.frames_begun += 1;
        log::trace!("begin frame {}", self.counter.frame_name(frame));
        Ok(())
    }
}
// recording
impl FrameManager {
    /// 从槽位中借出一个 pool
    pub fn take_pool(&mut self, frame: FrameIndex, queue: QueueKind) -> RhiResult<CommandPool> {
        self.ensure_open(frame)?;
        let pools = &mut self.slot_mut(frame).resources.free_pools;
        let pool = match pools.iter().position(|p| p.queue() == queue) {
            Some(i) => pools.swap_remove(i),
            None => CommandPool::new(queue),
        };
        Ok(pool)
    }

    /// 归还 pool：提交过的 pool 等待 fence，没有用过的直接可以复用
    pub fn return_pool(&mut self, frame: FrameIndex, pool: CommandPool, submitted: bool) {
        let resources = &mut self.slot_mut(frame).resources;
        if submitted {
            resources.submitted_pools.push(pool);
        } else {
            resources.free_pools.push(pool);
        }
    }

    /// 登记一个随着 frame 提交而销毁的临时资源
    pub fn add_transient(&mut self, frame: FrameIndex, handle: RawHandle) -> RhiResult<()> {
        self.ensure_open(frame)?;
        self.slot_mut(frame).resources.transient.push(handle);
        Ok(())
    }

    pub fn take_transient(&mut self, frame: FrameIndex) -> Vec<RawHandle> {
        std::mem::take(&mut self.slot_mut(frame).resources.transient)
    }

    pub fn staging_mut(&mut self, frame: FrameIndex) -> RhiResult<&mut StagingBelt> {
        self.ensure_open(frame)?;
        Ok(&mut self.slot_mut(frame).resources.staging)
    }
}
// submit & retire
impl FrameManager {
    /// 把 fence 挂到槽位上并关闭这一帧
    pub fn submit(&mut self, frame: FrameIndex, fence: Fence) -> RhiResult<()> {
        self.ensure_open(frame)?;
        let slot = self.slot_mut(frame);
        slot.fence = Some(fence);

        self.open = None;
        self.last_submitted = Some(frame);
        self.stats.frames_submitted += 1;
        self.stats.max_in_flight = self.stats.max_in_flight.max(self.in_flight());
        Ok(())
    }

    /// 推进完成水位线：按帧的顺序检查 fence，遇到第一个没有完成的帧就停止
    pub fn poll_completed(&mut self) -> Option<FrameIndex> {
        let Some(last_submitted) = self.last_submitted else {
            return self.completed;
        };

        let mut frame = self.completed.map_or(FrameIndex(0), FrameIndex::next);
        while frame <= last_submitted {
            let slot = &self.slots[frame.slot(self.fif_count())];
            let done = match slot.last_frame {
                // 槽位已经被之后的帧复用，说明这一帧早已完成
                Some(last) if last > frame => true,
                Some(last) if last == frame => slot.is_idle(),
                _ => false,
            };
            if !done {
                break;
            }
            self.completed = Some(frame);
            frame = frame.next();
        }
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    use crate::backend::headless::{HeadlessBackend, HeadlessConfig};
    use crate::queue::Queue;

    fn submit_empty(manager: &mut FrameManager, queue: &mut Queue, frame: FrameIndex) {
        let point = queue.submit(frame, None, Vec::new(), 0, format!("{frame}")).unwrap();
        let mut fence = Fence::new(frame);
        fence.add(point, queue.backend().clone());
        manager.submit(frame, fence).unwrap();
    }

    fn wait_for_next_slot(manager: &mut FrameManager) -> RhiResult<FrameIndex> {
        let (frame, fence) = manager.next_slot()?;
        if let Some(fence) = fence {
            let start = Instant::now();
            let signaled = fence.wait(manager.fence_timeout())?;
            manager.record_slot_wait(&fence, start.elapsed(), signaled)?;
        }
        Ok(frame)
    }

    fn begin(manager: &mut FrameManager, backend: &HeadlessBackend) -> RhiResult<FrameIndex> {
        let frame = wait_for_next_slot(manager)?;
        manager.begin(frame, backend)?;
        Ok(frame)
    }

    #[test]
    fn test_begin_requires_submit() {
        let backend = HeadlessBackend::new(HeadlessConfig::default());
        let mut manager = FrameManager::new(&RhiConfig::default());
        let frame = begin(&mut manager, &backend).unwrap();
        assert_eq!(frame, FrameIndex(0));
        assert_eq!(begin(&mut manager, &backend), Err(RhiError::FrameNotSubmitted(frame)));
        assert_eq!(manager.ensure_open(FrameIndex(1)), Err(RhiError::FrameNotActive(FrameIndex(1))));
    }

    #[test]
    fn test_in_flight_is_bounded() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig::default()));
        let config = RhiConfig::default()
            .with_frames_in_flight(2)
            .with_fence_timeout(Duration::from_millis(20));
        let mut manager = FrameManager::new(&config);
        let mut queue = Queue::new(QueueKind::Graphics, backend.queue(QueueKind::Graphics).unwrap());

        backend.pause();
        for _ in 0..2 {
            let frame = begin(&mut manager, &backend).unwrap();
            submit_empty(&mut manager, &mut queue, frame);
        }
        assert_eq!(manager.in_flight(), 2);

        // 第 N+1 帧等待槽位 0，GPU 暂停时超时
        assert_eq!(
            wait_for_next_slot(&mut manager),
            Err(RhiError::FenceTimeout {
                frame: FrameIndex(0),
                timeout_ms: 20
            })
        );
        assert_eq!(manager.poll_completed(), None);

        backend.resume();
        assert!(queue.wait(2, Duration::from_secs(5)).unwrap());
        let frame = begin(&mut manager, &backend).unwrap();
        assert_eq!(frame, FrameIndex(2));
        assert!(manager.poll_completed() >= Some(FrameIndex(0)));
        assert!(manager.stats().max_in_flight <= 2);
        assert_eq!(manager.stats().fence_timeouts, 1);
    }

    #[test]
    fn test_completed_watermark_is_ordered() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig::default()));
        let mut manager = FrameManager::new(&RhiConfig::default().with_frames_in_flight(3));
        let mut queue = Queue::new(QueueKind::Graphics, backend.queue(QueueKind::Graphics).unwrap());

        for _ in 0..3 {
            let frame = begin(&mut manager, &backend).unwrap();
            submit_empty(&mut manager, &mut queue, frame);
        }
        let queue_backend = queue.backend().clone();
        assert!(queue_backend.wait_value(3, Duration::from_secs(5)).unwrap());
        assert_eq!(manager.poll_completed(), Some(FrameIndex(2)));
        // 幂等
        assert_eq!(manager.poll_completed(), Some(FrameIndex(2)));
    }

    #[test]
    fn test_pools_recycled_after_slot_reuse() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig::default()));
        let mut manager = FrameManager::new(&RhiConfig::default().with_frames_in_flight(1));
        let mut queue = Queue::new(QueueKind::Graphics, backend.queue(QueueKind::Graphics).unwrap());

        let frame = begin(&mut manager, &backend).unwrap();
        let pool = manager.take_pool(frame, QueueKind::Graphics).unwrap();
        let id = pool.id();
        manager.return_pool(frame, pool, true);
        submit_empty(&mut manager, &mut queue, frame);

        let frame = begin(&mut manager, &backend).unwrap();
        assert_eq!(manager.take_pool(frame, QueueKind::Graphics).unwrap().id(), id);
        assert_eq!(backend.pool_resets(), 2);
    }
}
