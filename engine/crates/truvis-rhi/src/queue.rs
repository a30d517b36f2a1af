//! 硬件 queue 的封装
//!
//! 每个 queue 持有一个单调递增的 timeline，每次提交 signal 下一个值。
//! Fence 就是一组 (queue, value)。

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendQueue, EncodedCommands, SubmitBatch};
use crate::error::{RhiError, RhiResult};
use crate::frame::FrameIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Graphics, QueueKind::Compute, QueueKind::Transfer];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueKind::Graphics => "graphics",
            QueueKind::Compute => "compute",
            QueueKind::Transfer => "transfer",
        };
        f.write_str(name)
    }
}

/// queue timeline 上的一个点
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimelinePoint {
    pub queue: QueueKind,
    pub value: u64,
}

impl TimelinePoint {
    #[inline]
    pub const fn new(queue: QueueKind, value: u64) -> Self {
        Self { queue, value }
    }
}

/// 一次提交的记录
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub frame: FrameIndex,
    pub signal: u64,
    pub waits: Vec<TimelinePoint>,
    pub stream_count: usize,
    pub label: String,
}

pub struct Queue {
    kind: QueueKind,
    backend: Arc<dyn BackendQueue>,

    /// 最后一次提交 signal 的值
    last_signaled: u64,

    /// 最近的提交记录，超过上限时丢弃最旧的
    history: VecDeque<SubmissionRecord>,
    history_limit: usize,
}
// new & init
impl Queue {
    pub const DEFAULT_HISTORY_LIMIT: usize = 64;

    pub fn new(kind: QueueKind, backend: Arc<dyn BackendQueue>) -> Self {
        Self {
            kind,
            backend,
            last_signaled: 0,
            history: VecDeque::new(),
            history_limit: Self::DEFAULT_HISTORY_LIMIT,
        }
    }
}
// getters
impl Queue {
    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    #[inline]
    pub fn backend(&self) -> &Arc<dyn BackendQueue> {
        &self.backend
    }

    #[inline]
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    /// 下一次提交将要 signal 的点
    #[inline]
    pub fn next_point(&self) -> TimelinePoint {
        TimelinePoint::new(self.kind, self.last_signaled + 1)
    }

    #[inline]
    pub fn completed_value(&self) -> u64 {
        self.backend.completed_value()
    }

    #[inline]
    pub fn history(&self) -> impl Iterator<Item = &SubmissionRecord> {
        self.history.iter()
    }
}
// tools
impl Queue {
    /// 提交一批命令，signal 下一个 timeline 值
    pub fn submit(
        &mut self,
        frame: FrameIndex,
        commands: Option<EncodedCommands>,
        waits: Vec<TimelinePoint>,
        stream_count: usize,
        label: String,
    ) -> RhiResult<TimelinePoint> {
        let _span = crate::rhi_span!("Queue::submit");

        let point = self.next_point();
        self.backend.submit(SubmitBatch {
            commands,
            waits: waits.clone(),
            signal: point.value,
            label: label.clone(),
        })?;
        self.last_signaled = point.value;

        log::trace!("{} queue submit {}: signal {}, waits {:?}", self.kind, label, point.value, waits);
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(SubmissionRecord {
            frame,
            signal: point.value,
            waits,
            stream_count,
            label,
        });
        Ok(point)
    }

    #[inline]
    pub fn is_reached(&self, value: u64) -> bool {
        self.backend.completed_value() >= value
    }

    /// 等待 timeline 到达 value，超时返回 false
    pub fn wait(&self, value: u64, timeout: Duration) -> RhiResult<bool> {
        self.backend.wait_value(value, timeout)
    }

    /// 等待所有已经提交的工作完成
    pub fn wait_idle(&self, timeout: Duration) -> RhiResult<()> {
        if self.wait(self.last_signaled, timeout)? {
            Ok(())
        } else {
            Err(RhiError::Backend(format!("{} queue did not become idle in {timeout:?}", self.kind)))
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("kind", &self.kind)
            .field("last_signaled", &self.last_signaled)
            .finish()
    }
}
