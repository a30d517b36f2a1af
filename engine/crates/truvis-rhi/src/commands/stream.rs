use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexSet;

use crate::commands::WorkerId;
use crate::commands::command::Command;
use crate::frame::FrameIndex;
use crate::queue::QueueKind;
use crate::resource::handles::RawHandle;
use crate::sync::{AccessDeclaration, StreamAccess};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// recorder 私有的命令存储
///
/// 从 FrameSlot 中借出，提交之后归还给同一个槽位，
/// 槽位的 fence 完成之后才会被下一个 recorder 复用（保留 Vec 的容量）。
#[derive(Debug)]
pub struct CommandPool {
    id: u64,
    queue: QueueKind,
    commands: Vec<Command>,
    declarations: Vec<AccessDeclaration>,
}
// new & init
impl CommandPool {
    pub fn new(queue: QueueKind) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            queue,
            commands: Vec::new(),
            declarations: Vec::new(),
        }
    }
}
// getters
impl CommandPool {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.queue
    }
}
// tools
impl CommandPool {
    /// 取出命令存储，交给 recording session 使用
    pub(crate) fn take_storage(&mut self) -> (Vec<Command>, Vec<AccessDeclaration>) {
        (std::mem::take(&mut self.commands), std::mem::take(&mut self.declarations))
    }

    /// 归还存储，清空内容但保留容量
    pub(crate) fn restore_storage(&mut self, mut commands: Vec<Command>, mut declarations: Vec<AccessDeclaration>) {
        commands.clear();
        declarations.clear();
        self.commands = commands;
        self.declarations = declarations;
    }
}

/// 一个 recorder 录制完成的命令序列
///
/// 录制结束之后不可修改，只能被 `submit_frame` 消费一次。
#[derive(Debug)]
pub struct CommandStream {
    pub(crate) frame: FrameIndex,
    pub(crate) queue: QueueKind,
    pub(crate) worker: WorkerId,
    pub(crate) label: String,

    pub(crate) commands: Vec<Command>,
    pub(crate) declarations: Vec<AccessDeclaration>,
    /// 按资源汇总后的访问，用于 stream 之间的同步推导
    pub(crate) accesses: Vec<StreamAccess>,
    /// 所有引用过的资源（包括 pipeline、descriptor set 等没有访问声明的资源）
    pub(crate) referenced: IndexSet<RawHandle>,

    pub(crate) pool: CommandPool,
}
// getters
impl CommandStream {
    #[inline]
    pub fn frame(&self) -> FrameIndex {
        self.frame
    }

    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    #[inline]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[inline]
    pub fn declarations(&self) -> &[AccessDeclaration] {
        &self.declarations
    }

    #[inline]
    pub fn accesses(&self) -> &[StreamAccess] {
        &self.accesses
    }

    #[inline]
    pub fn referenced(&self) -> impl Iterator<Item = RawHandle> + '_ {
        self.referenced.iter().copied()
    }

    /// stream 内部插入的 barrier 数量
    pub fn barrier_count(&self) -> usize {
        self.commands.iter().filter(|c| c.is_barrier()).count()
    }
}
// tools
impl CommandStream {
    /// 提交之后把存储还给 pool
    pub(crate) fn into_pool(self) -> CommandPool {
        let mut pool = self.pool;
        pool.restore_storage(self.commands, self.declarations);
        pool
    }
}
