//! 命令录制
//!
//! 每个 worker 线程每帧获取一个 `CommandRecorder`，录制结束得到不可变的 `CommandStream`，
//! 之后通过 channel 等方式交给提交线程。

pub mod command;
pub mod recorder;
pub mod staging;
pub mod stream;

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub use command::{Attachment, ClearValue, Command, IndexType, LoadOp, RenderingInfo};
pub use recorder::{CommandRecorder, RecordingSession};
pub use stream::{CommandPool, CommandStream};

/// 录制线程的标识
///
/// 同一帧中每个 worker 只能获取一个 recorder。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

impl WorkerId {
    /// 当前线程的 id，第一次调用时分配
    pub fn current() -> Self {
        CURRENT_WORKER.with(|current| match current.get() {
            Some(id) => id,
            None => {
                let id = WorkerId(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed));
                current.set(Some(id));
                id
            }
        })
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}
