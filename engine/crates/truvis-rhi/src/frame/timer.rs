use std::time::{Duration, Instant};

/// CPU 侧的帧计时
#[derive(Debug)]
pub struct FrameTimer {
    last_tick: Instant,

    delta_time: Duration,
    total_time: Duration,

    /// 平滑后的帧率
    smoothed_fps: f32,
    /// 上一帧在 begin_frame 中等待 fence 的时间
    last_stall: Duration,
    total_stall: Duration,

    paused: bool,
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self {
            last_tick: Instant::now(),
            delta_time: Duration::ZERO,
            total_time: Duration::ZERO,
            smoothed_fps: 0.0,
            last_stall: Duration::ZERO,
            total_stall: Duration::ZERO,
            paused: false,
        }
    }
}
// update
impl FrameTimer {
    const FPS_SMOOTHING: f32 = 0.1;

    /// 每帧开始的时候调用
    pub fn tick(&mut self) {
        let now = Instant::now();
        let delta = now.duration_since(self.last_tick);
        self.last_tick = now;
        if self.paused {
            self.delta_time = Duration::ZERO;
            return;
        }

        self.delta_time = delta;
        self.total_time += delta;
        let secs = delta.as_secs_f32();
        if secs > 0.0 {
            let fps = 1.0 / secs;
            self.smoothed_fps = if self.smoothed_fps == 0.0 {
                fps
            } else {
                self.smoothed_fps + (fps - self.smoothed_fps) * Self::FPS_SMOOTHING
            };
        }
    }

    pub fn record_stall(&mut self, stall: Duration) {
        self.last_stall = stall;
        self.total_stall += stall;
    }

    #[inline]
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// 恢复后第一帧的 delta 从恢复时开始计算
    #[inline]
    pub fn resume(&mut self) {
        self.paused = false;
        self.last_tick = Instant::now();
    }
}
// getters
impl FrameTimer {
    #[inline]
    pub fn delta_time(&self) -> Duration {
        self.delta_time
    }

    /// 上一帧的时间（毫秒）
    #[inline]
    pub fn delta_time_ms(&self) -> f32 {
        self.delta_time.as_secs_f32() * 1000.0
    }

    #[inline]
    pub fn fps(&self) -> f32 {
        self.smoothed_fps
    }

    #[inline]
    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    #[inline]
    pub fn last_stall(&self) -> Duration {
        self.last_stall
    }

    #[inline]
    pub fn total_stall(&self) -> Duration {
        self.total_stall
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_timer_does_not_accumulate() {
        let mut timer = FrameTimer::default();
        timer.pause();
        std::thread::sleep(Duration::from_millis(2));
        timer.tick();
        assert_eq!(timer.delta_time(), Duration::ZERO);
        assert_eq!(timer.total_time(), Duration::ZERO);

        timer.resume();
        std::thread::sleep(Duration::from_millis(2));
        timer.tick();
        assert!(timer.delta_time() >= Duration::from_millis(2));
        assert!(timer.fps() > 0.0);
    }

    #[test]
    fn test_stall_accumulates() {
        let mut timer = FrameTimer::default();
        timer.record_stall(Duration::from_millis(3));
        timer.record_stall(Duration::from_millis(4));
        assert_eq!(timer.last_stall(), Duration::from_millis(4));
        assert_eq!(timer.total_stall(), Duration::from_millis(7));
    }
}
