//! 多帧并行（frames in flight）的管理

pub mod fence;
pub mod frame_counter;
pub mod manager;
pub mod timer;

use std::fmt;

pub use fence::Fence;
pub use frame_counter::{FrameCounter, FrameLabel};
pub use manager::{FrameManager, FrameStats, RetireReport};
pub use timer::FrameTimer;

/// 帧序号，从 0 开始一直累加
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameIndex(pub u64);

impl FrameIndex {
    /// 这一帧使用的 FrameSlot
    #[inline]
    pub const fn slot(self, frames_in_flight: usize) -> usize {
        (self.0 % frames_in_flight as u64) as usize
    }

    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[inline]
    pub const fn prev(self) -> Option<Self> {
        match self.0 {
            0 => None,
            n => Some(Self(n - 1)),
        }
    }
}

impl fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}
