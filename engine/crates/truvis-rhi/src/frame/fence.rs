use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::BackendQueue;
use crate::error::RhiResult;
use crate::frame::FrameIndex;
use crate::queue::TimelinePoint;

/// 一帧的完成信号
///
/// 由这一帧在每个 queue 上最后一次提交的 timeline point 组成，
/// 所有 point 都到达时这一帧的 GPU 工作全部完成。
#[derive(Clone)]
pub struct Fence {
    frame: FrameIndex,
    points: Vec<(TimelinePoint, Arc<dyn BackendQueue>)>,
}
// new & init
impl Fence {
    pub fn new(frame: FrameIndex) -> Self {
        Self {
            frame,
            points: Vec::new(),
        }
    }

    /// 同一个 queue 只保留最大的值
    pub fn add(&mut self, point: TimelinePoint, queue: Arc<dyn BackendQueue>) {
        debug_assert_eq!(point.queue, queue.kind());
        match self.points.iter_mut().find(|(p, _)| p.queue == point.queue) {
            Some((existing, _)) => existing.value = existing.value.max(point.value),
            None => self.points.push((point, queue)),
        }
    }
}
// getters
impl Fence {
    #[inline]
    pub fn frame(&self) -> FrameIndex {
        self.frame
    }

    pub fn points(&self) -> impl Iterator<Item = TimelinePoint> + '_ {
        self.points.iter().map(|(p, _)| *p)
    }
}
// tools
impl Fence {
    /// 不阻塞地查询
    pub fn is_signaled(&self) -> bool {
        self.points.iter().all(|(p, queue)| queue.completed_value() >= p.value)
    }

    /// 等待所有 point 到达，超时返回 Ok(false)
    ///
    /// 设备丢失时返回 `DeviceLost`，不会一直挂起。
    pub fn wait(&self, timeout: Duration) -> RhiResult<bool> {
        let _span = crate::rhi_span!("Fence::wait");
        let deadline = Instant::now() + timeout;
        for (point, queue) in &self.points {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !queue.wait_value(point.value, remaining)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("frame", &self.frame)
            .field("points", &self.points.iter().map(|(p, _)| p).collect::<Vec<_>>())
            .finish()
    }
}
