use std::fmt::Display;

use crate::config::MAX_FRAMES_IN_FLIGHT;
use crate::frame::FrameIndex;

/// 帧标签（A/B/C/...）
///
/// 表示当前处于 Frames in Flight 的哪一个槽位，只用于日志和调试名称。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLabel(usize);

impl FrameLabel {
    #[inline]
    pub fn from_usize(idx: usize) -> Self {
        debug_assert!(idx < MAX_FRAMES_IN_FLIGHT, "invalid frame slot: {idx}");
        Self(idx)
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.0
    }
}

impl Display for FrameLabel {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", (b'A' + self.0 as u8) as char)
    }
}

pub struct FrameCounter {
    /// 下一个要开始的帧序号，一直累加
    next_frame: FrameIndex,
    fif_count: usize,
}
// new & init
impl FrameCounter {
    pub fn new(init_frame: FrameIndex, fif_count: usize) -> Self {
        Self {
            next_frame: init_frame,
            fif_count,
        }
    }
}
// update
impl FrameCounter {
    /// 取出下一帧的序号并前进
    #[inline]
    pub fn advance(&mut self) -> FrameIndex {
        let frame = self.next_frame;
        self.next_frame = frame.next();
        frame
    }
}
// getters
impl FrameCounter {
    #[inline]
    pub fn peek(&self) -> FrameIndex {
        self.next_frame
    }

    #[inline]
    pub fn fif_count(&self) -> usize {
        self.fif_count
    }

    #[inline]
    pub fn frame_label(&self, frame: FrameIndex) -> FrameLabel {
        FrameLabel::from_usize(frame.slot(self.fif_count))
    }

    #[inline]
    pub fn frame_name(&self, frame: FrameIndex) -> String {
        format!("[F{}{}]", frame.0, self.frame_label(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_names() {
        let mut counter = FrameCounter::new(FrameIndex(0), 3);
        let names: Vec<_> = (0..4)
            .map(|_| {
                let frame = counter.advance();
                counter.frame_name(frame)
            })
            .collect();
        assert_eq!(names, vec!["[F0A]", "[F1B]", "[F2C]", "[F3A]"]);
        assert_eq!(counter.peek(), FrameIndex(4));
    }
}
