use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{RhiError, RhiResult};
use crate::queue::{QueueKind, TimelinePoint};

#[derive(Debug, Default)]
struct TimelineState {
    values: [u64; 3],
    /// 暂停时 worker 不会开始执行新的 batch
    paused: bool,
    lost: bool,
    shutdown: bool,
}

/// 所有 queue 共享的 timeline 值
///
/// 一把锁加一个 condvar，所有等待者在值变化、暂停恢复、设备丢失时被唤醒。
#[derive(Debug, Default)]
pub(crate) struct Timeline {
    state: Mutex<TimelineState>,
    cond: Condvar,
}
// getters
impl Timeline {
    #[inline]
    pub fn value(&self, queue: QueueKind) -> u64 {
        self.state.lock().values[queue.index()]
    }

    #[inline]
    pub fn is_lost(&self) -> bool {
        self.state.lock().lost
    }
}
// update
impl Timeline {
    pub fn signal(&self, queue: QueueKind, value: u64) {
        let mut state = self.state.lock();
        let slot = &mut state.values[queue.index()];
        *slot = (*slot).max(value);
        self.cond.notify_all();
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
        self.cond.notify_all();
    }

    pub fn lose(&self) {
        self.state.lock().lost = true;
        self.cond.notify_all();
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }
}
// wait
impl Timeline {
    /// worker 在执行一个 batch 之前调用：等待所有 wait point 到达并且没有暂停
    ///
    /// 设备丢失或者关闭时返回 false。
    pub fn wait_ready(&self, waits: &[TimelinePoint]) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.lost || state.shutdown {
                return false;
            }
            if !state.paused && waits.iter().all(|w| state.values[w.queue.index()] >= w.value) {
                return true;
            }
            self.cond.wait(&mut state);
        }
    }

    pub fn wait_value(&self, queue: QueueKind, value: u64, timeout: Duration) -> RhiResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.values[queue.index()] >= value {
                return Ok(true);
            }
            if state.lost {
                return Err(RhiError::DeviceLost);
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.values[queue.index()] >= value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_wait_value_times_out() {
        let timeline = Timeline::default();
        let reached = timeline.wait_value(QueueKind::Graphics, 1, Duration::from_millis(5)).unwrap();
        assert!(!reached);
    }

    #[test]
    fn test_lost_unblocks_waiters() {
        let timeline = Arc::new(Timeline::default());
        let waiter = {
            let timeline = timeline.clone();
            std::thread::spawn(move || timeline.wait_value(QueueKind::Compute, 10, Duration::from_secs(30)))
        };
        std::thread::sleep(Duration::from_millis(10));
        timeline.lose();
        assert_eq!(waiter.join().unwrap(), Err(RhiError::DeviceLost));
    }

    #[test]
    fn test_paused_blocks_ready() {
        let timeline = Arc::new(Timeline::default());
        timeline.set_paused(true);
        let worker = {
            let timeline = timeline.clone();
            std::thread::spawn(move || timeline.wait_ready(&[]))
        };
        std::thread::sleep(Duration::from_millis(10));
        assert!(!worker.is_finished());
        timeline.set_paused(false);
        assert!(worker.join().unwrap());
    }
}
