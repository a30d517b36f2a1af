use std::fmt;

use crate::commands::WorkerId;
use crate::frame::FrameIndex;
use crate::queue::QueueKind;
use crate::resource::desc::MemoryLocality;

/// RHI 的错误类型
///
/// - 描述符、分配相关的错误直接返回给调用者，调用者可以修正参数或释放资源后重试
/// - 句柄、录制协议相关的错误属于调用方的编程错误，不应重试
/// - `DeviceLost` 是致命错误，Device 之后的所有调用都会失败
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RhiError {
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("stale handle: slot {index}, generation {generation}")]
    StaleHandle { index: u32, generation: u32 },

    #[error("invalid handle: slot {index}")]
    InvalidHandle { index: u32 },

    #[error("out of device memory: {requested} bytes from {locality:?}")]
    OutOfDeviceMemory { locality: MemoryLocality, requested: u64 },

    #[error("resource table is full, capacity {capacity}")]
    OutOfTableSpace { capacity: u32 },

    #[error("recorder for {frame} on {worker} was already acquired")]
    RecorderAlreadyAcquired { frame: FrameIndex, worker: WorkerId },

    #[error("recorder is closed")]
    RecorderClosed,

    #[error("device lost")]
    DeviceLost,

    #[error("{0} is not the frame being recorded")]
    FrameNotActive(FrameIndex),

    #[error("{0} was begun but not submitted")]
    FrameNotSubmitted(FrameIndex),

    #[error("stream recorded for {stream} was submitted with {frame}")]
    FrameMismatch { frame: FrameIndex, stream: FrameIndex },

    #[error("waiting for {frame} timed out after {timeout_ms} ms")]
    FenceTimeout { frame: FrameIndex, timeout_ms: u64 },

    #[error("queue {0:?} is not available on this device")]
    QueueUnavailable(QueueKind),

    /// 录制时命令的参数或者状态不合法
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("range [{offset}, {offset}+{size}) is out of bounds ({len} bytes)")]
    InvalidRange { offset: u64, size: u64, len: u64 },

    #[error("resource is not host visible")]
    NotHostVisible,

    #[error("surface error: {0}")]
    Surface(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(String),
}

pub type RhiResult<T> = Result<T, RhiError>;

impl RhiError {
    /// 是否是不可恢复的错误
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, RhiError::DeviceLost)
    }

    pub(crate) fn invalid_descriptor(label: &str, reason: impl fmt::Display) -> Self {
        RhiError::InvalidDescriptor(format!("{label}: {reason}"))
    }

    pub(crate) fn invalid_command(reason: impl fmt::Display) -> Self {
        RhiError::InvalidCommand(reason.to_string())
    }

    /// 检查 [offset, offset + size) 是否落在 [0, len) 内
    pub(crate) fn check_range(offset: u64, size: u64, len: u64) -> RhiResult<()> {
        match offset.checked_add(size) {
            Some(end) if end <= len => Ok(()),
            _ => Err(RhiError::InvalidRange { offset, size, len }),
        }
    }
}

impl From<std::io::Error> for RhiError {
    fn from(e: std::io::Error) -> Self {
        RhiError::Io(e.to_string())
    }
}
