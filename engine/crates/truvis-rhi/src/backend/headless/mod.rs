//! CPU 模拟的后端
//!
//! - device memory 是 `Vec<u8>`，带有预算，可以模拟显存不足
//! - 每个 queue 一个 worker 线程，按提交顺序执行，完成后推进 timeline
//! - 可以暂停 GPU（模拟 GPU 落后于 CPU）、恢复、或者模拟设备丢失
//!
//! 行为是确定的，主要用于测试和没有 GPU 的环境。

mod executor;
mod memory;
mod surface;
mod timeline;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::backend::headless::memory::MemoryStore;
use crate::backend::headless::surface::HeadlessSurface;
use crate::backend::headless::timeline::Timeline;
use crate::backend::{
    BackendInfo, BackendQueue, BackendSurface, CommandEncoder, DeviceMemoryId, EncodedCommands, GfxBackend,
    MemoryBinding, MemoryRequirements, ObjectDesc, ObjectId, ResolvedCommand, SubmitBatch,
};
use crate::error::{RhiError, RhiResult};
use crate::queue::{QueueKind, TimelinePoint};
use crate::resource::desc::{ImageDesc, MemoryLocality};
use crate::resource::handles::ResourceType;
use crate::swapchain::SurfaceTarget;

pub use surface::PresentEvent;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadlessConfig {
    /// 第一个是主 queue
    pub queues: Vec<QueueKind>,
    pub device_local_budget: u64,
    pub host_visible_budget: u64,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            queues: QueueKind::ALL.to_vec(),
            device_local_budget: 1 << 30,
            host_visible_budget: 256 << 20,
        }
    }
}

/// 一个已经执行完成的 batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutedBatch {
    pub queue: QueueKind,
    pub signal: u64,
    pub label: String,
    pub commands: Vec<&'static str>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum HeadlessObject {
    Buffer { binding: MemoryBinding },
    Image { binding: MemoryBinding, desc: ImageDesc },
    Other(ResourceType),
}

/// worker 线程和后端共享的状态
pub(crate) struct HeadlessShared {
    pub(crate) memory: Mutex<MemoryStore>,
    pub(crate) objects: RwLock<HashMap<ObjectId, HeadlessObject>>,
    pub(crate) timeline: Timeline,
    trace: Mutex<Vec<ExecutedBatch>>,
    presents: Mutex<Vec<PresentEvent>>,
    next_object: AtomicU64,
    pool_resets: AtomicU64,
    /// 这个 queue 上的 encoder 在 encode 时失败
    failing_encoder: Mutex<Option<QueueKind>>,
}

impl HeadlessShared {
    pub(crate) fn next_object_id(&self) -> ObjectId {
        ObjectId(self.next_object.fetch_add(1, Ordering::Relaxed))
    }
}

/// encoder 的产物
struct HeadlessCommands(Vec<ResolvedCommand>);

struct HeadlessEncoder {
    queue: QueueKind,
    fail: bool,
    commands: Vec<ResolvedCommand>,
}

impl CommandEncoder for HeadlessEncoder {
    fn encode(&mut self, command: &ResolvedCommand) -> RhiResult<()> {
        if self.fail {
            return Err(RhiError::Backend(format!("simulated encode failure on {} queue", self.queue)));
        }
        self.commands.push(command.clone());
        Ok(())
    }

    fn finish(self: Box<Self>) -> RhiResult<EncodedCommands> {
        Ok(EncodedCommands::new(HeadlessCommands(self.commands)))
    }
}

enum Job {
    Execute {
        commands: Vec<ResolvedCommand>,
        waits: Vec<TimelinePoint>,
        signal: u64,
        label: String,
    },
    Shutdown,
}

pub struct HeadlessQueue {
    kind: QueueKind,
    shared: Arc<HeadlessShared>,
    sender: Sender<Job>,
    /// 已经入队的最大 signal 值
    submitted: AtomicU64,
}

impl BackendQueue for HeadlessQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn submit(&self, batch: SubmitBatch) -> RhiResult<()> {
        if self.shared.timeline.is_lost() {
            return Err(RhiError::DeviceLost);
        }
        let commands = match batch.commands {
            Some(encoded) => match encoded.downcast::<HeadlessCommands>() {
                Ok(HeadlessCommands(commands)) => commands,
                Err(_) => return Err(RhiError::Backend("commands were not encoded by the headless backend".into())),
            },
            None => Vec::new(),
        };
        let signal = batch.signal;
        self.sender
            .send(Job::Execute {
                commands,
                waits: batch.waits,
                signal,
                label: batch.label,
            })
            .map_err(|_| RhiError::DeviceLost)?;
        self.submitted.fetch_max(signal, Ordering::AcqRel);
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        self.shared.timeline.value(self.kind)
    }

    fn wait_value(&self, value: u64, timeout: Duration) -> RhiResult<bool> {
        self.shared.timeline.wait_value(self.kind, value, timeout)
    }
}

fn run_worker(kind: QueueKind, shared: Arc<HeadlessShared>, receiver: Receiver<Job>) {
    while let Ok(Job::Execute {
        commands,
        waits,
        signal,
        label,
    }) = receiver.recv()
    {
        if !shared.timeline.wait_ready(&waits) {
            break;
        }

        if let Err(e) = executor::execute(&shared, &commands) {
            log::error!("headless {} queue failed to execute {}: {}", kind, label, e);
            shared.timeline.lose();
            break;
        }

        shared.trace.lock().push(ExecutedBatch {
            queue: kind,
            signal,
            label,
            commands: commands.iter().map(|c| c.name()).collect(),
        });
        shared.timeline.signal(kind, signal);
    }
    log::debug!("headless {} queue worker exit", kind);
}

pub struct HeadlessBackend {
    info: BackendInfo,
    shared: Arc<HeadlessShared>,
    queues: Vec<Arc<HeadlessQueue>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}
// new & init
impl HeadlessBackend {
    pub fn new(config: HeadlessConfig) -> Self {
        let shared = Arc::new(HeadlessShared {
            memory: Mutex::new(MemoryStore::new(config.device_local_budget, config.host_visible_budget)),
            objects: RwLock::new(HashMap::new()),
            timeline: Timeline::default(),
            trace: Mutex::new(Vec::new()),
            presents: Mutex::new(Vec::new()),
            next_object: AtomicU64::new(1),
            pool_resets: AtomicU64::new(0),
            failing_encoder: Mutex::new(None),
        });

        let mut queues = Vec::new();
        let mut workers = Vec::new();
        for &kind in &config.queues {
            let (sender, receiver) = crossbeam_channel::unbounded();
            let worker_shared = shared.clone();
            let worker = std::thread::Builder::new()
                .name(format!("headless-{kind}"))
                .spawn(move || run_worker(kind, worker_shared, receiver));
            match worker {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    log::error!("failed to spawn headless {} queue worker: {}", kind, e);
                    continue;
                }
            }
            queues.push(Arc::new(HeadlessQueue {
                kind,
                shared: shared.clone(),
                sender,
                submitted: AtomicU64::new(0),
            }));
        }

        let info = BackendInfo {
            name: "headless".to_string(),
            queues: queues.iter().map(|q| q.kind).collect(),
            device_local_budget: Some(config.device_local_budget),
            host_visible_budget: Some(config.host_visible_budget),
        };
        log::info!("headless backend created with queues {:?}", info.queues);

        Self {
            info,
            shared,
            queues,
            workers: Mutex::new(workers),
        }
    }
}
// 模拟控制
impl HeadlessBackend {
    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    /// 暂停 GPU：已经提交的 batch 不再开始执行
    pub fn pause(&self) {
        log::debug!("headless backend paused");
        self.shared.timeline.set_paused(true);
    }

    pub fn resume(&self) {
        log::debug!("headless backend resumed");
        self.shared.timeline.set_paused(false);
    }

    /// 模拟设备丢失，所有等待立即失败
    pub fn lose_device(&self) {
        log::warn!("headless backend: simulated device lost");
        self.shared.timeline.lose();
    }

    /// 之后在 queue 上创建的 encoder 编码任何命令都会失败，None 取消
    pub fn fail_encoding_on(&self, queue: Option<QueueKind>) {
        *self.shared.failing_encoder.lock() = queue;
    }
}
// getters
impl HeadlessBackend {
    /// 已经执行的 batch，按完成顺序
    pub fn executed_batches(&self) -> Vec<ExecutedBatch> {
        self.shared.trace.lock().clone()
    }

    pub fn presents(&self) -> Vec<PresentEvent> {
        self.shared.presents.lock().clone()
    }

    #[inline]
    pub fn memory_used(&self, locality: MemoryLocality) -> u64 {
        self.shared.memory.lock().used(locality)
    }

    #[inline]
    pub fn memory_allocation_count(&self) -> usize {
        self.shared.memory.lock().allocation_count()
    }

    #[inline]
    pub fn object_count(&self) -> usize {
        self.shared.objects.read().len()
    }

    #[inline]
    pub fn pool_resets(&self) -> u64 {
        self.shared.pool_resets.load(Ordering::Relaxed)
    }
}

impl GfxBackend for HeadlessBackend {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn queue(&self, kind: QueueKind) -> Option<Arc<dyn BackendQueue>> {
        self.queues
            .iter()
            .find(|q| q.kind == kind)
            .map(|q| q.clone() as Arc<dyn BackendQueue>)
    }

    fn allocate_memory(&self, locality: MemoryLocality, size: u64) -> RhiResult<DeviceMemoryId> {
        self.shared.memory.lock().allocate(locality, size, false)
    }

    fn free_memory(&self, memory: DeviceMemoryId) {
        if !self.shared.memory.lock().free(memory) {
            log::warn!("headless: free of unknown memory {:?}", memory);
        }
    }

    fn write_memory(&self, memory: DeviceMemoryId, offset: u64, data: &[u8]) -> RhiResult<()> {
        self.shared.memory.lock().write(memory, offset, data)
    }

    fn read_memory(&self, memory: DeviceMemoryId, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        self.shared.memory.lock().read(memory, offset, out)
    }

    fn memory_requirements(&self, desc: ObjectDesc<'_>) -> RhiResult<MemoryRequirements> {
        let requirements = match desc {
            ObjectDesc::Buffer(desc) => MemoryRequirements {
                size: desc.size,
                alignment: 256,
            },
            ObjectDesc::Image(desc) => MemoryRequirements {
                size: desc.total_size(),
                alignment: 1024,
            },
            _ => MemoryRequirements { size: 0, alignment: 1 },
        };
        Ok(requirements)
    }

    fn create_object(&self, desc: ObjectDesc<'_>, memory: Option<MemoryBinding>) -> RhiResult<ObjectId> {
        if self.shared.timeline.is_lost() {
            return Err(RhiError::DeviceLost);
        }
        let object = match (desc, memory) {
            (ObjectDesc::Buffer(_), Some(binding)) => HeadlessObject::Buffer { binding },
            (ObjectDesc::Image(desc), Some(binding)) => HeadlessObject::Image {
                binding,
                desc: desc.clone(),
            },
            (ObjectDesc::Buffer(_) | ObjectDesc::Image(_), None) => {
                return Err(RhiError::Backend("buffer and image objects need a memory binding".into()));
            }
            (other, _) => HeadlessObject::Other(other.resource_type()),
        };

        let id = self.shared.next_object_id();
        self.shared.objects.write().insert(id, object);
        Ok(id)
    }

    fn destroy_object(&self, object: ObjectId) {
        if self.shared.objects.write().remove(&object).is_none() {
            log::warn!("headless: destroy of unknown object {:?}", object);
        }
    }

    fn create_encoder(&self, queue: QueueKind, _slot: usize) -> RhiResult<Box<dyn CommandEncoder>> {
        Ok(Box::new(HeadlessEncoder {
            queue,
            fail: *self.shared.failing_encoder.lock() == Some(queue),
            commands: Vec::new(),
        }))
    }

    fn reset_command_pools(&self, _slot: usize) -> RhiResult<()> {
        self.shared.pool_resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn create_surface(&self, target: &SurfaceTarget) -> RhiResult<Box<dyn BackendSurface>> {
        log::info!("headless surface created for {:?}", target.extent());
        Ok(Box::new(HeadlessSurface::new(self.shared.clone())))
    }

    fn wait_idle(&self) -> RhiResult<()> {
        for queue in &self.queues {
            let target = queue.submitted.load(Ordering::Acquire);
            if !queue.wait_value(target, Self::IDLE_TIMEOUT)? {
                return Err(RhiError::Backend(format!("{} queue did not become idle", queue.kind)));
            }
        }
        Ok(())
    }
}

impl Drop for HeadlessBackend {
    fn drop(&mut self) {
        self.shared.timeline.shutdown();
        for queue in &self.queues {
            let _ = queue.sender.send(Job::Shutdown);
        }
        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                log::error!("headless queue worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ResolvedCommand;
    use crate::resource::desc::{BufferDesc, BufferUsage};

    fn buffer(backend: &HeadlessBackend, size: u64) -> (ObjectId, DeviceMemoryId) {
        let memory = backend.allocate_memory(MemoryLocality::HostVisible, size).unwrap();
        let desc = BufferDesc::new(size, BufferUsage::TRANSFER_DST, MemoryLocality::HostVisible, "b");
        let object = backend
            .create_object(ObjectDesc::Buffer(&desc), Some(MemoryBinding { memory, offset: 0, size }))
            .unwrap();
        (object, memory)
    }

    fn submit(backend: &HeadlessBackend, kind: QueueKind, commands: Vec<ResolvedCommand>, signal: u64) {
        let mut encoder = backend.create_encoder(kind, 0).unwrap();
        for command in &commands {
            encoder.encode(command).unwrap();
        }
        let encoded = encoder.finish().unwrap();
        backend
            .queue(kind)
            .unwrap()
            .submit(SubmitBatch {
                commands: Some(encoded),
                waits: Vec::new(),
                signal,
                label: format!("test {signal}"),
            })
            .unwrap();
    }

    #[test]
    fn test_executes_fill_and_signals() {
        let backend = HeadlessBackend::new(HeadlessConfig::default());
        let (object, memory) = buffer(&backend, 16);
        submit(
            &backend,
            QueueKind::Graphics,
            vec![ResolvedCommand::FillBuffer {
                dst: object,
                offset: 0,
                size: 16,
                value: 0x0403_0201,
            }],
            1,
        );

        let queue = backend.queue(QueueKind::Graphics).unwrap();
        assert!(queue.wait_value(1, Duration::from_secs(5)).unwrap());
        let mut out = [0u8; 8];
        backend.read_memory(memory, 0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 1, 2, 3, 4]);
        assert_eq!(backend.executed_batches()[0].commands, vec!["fill_buffer"]);
    }

    #[test]
    fn test_pause_holds_execution() {
        let backend = HeadlessBackend::new(HeadlessConfig::default());
        backend.pause();
        submit(&backend, QueueKind::Compute, Vec::new(), 1);

        let queue = backend.queue(QueueKind::Compute).unwrap();
        assert!(!queue.wait_value(1, Duration::from_millis(20)).unwrap());
        backend.resume();
        assert!(queue.wait_value(1, Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_cross_queue_wait() {
        let backend = HeadlessBackend::new(HeadlessConfig::default());
        backend.pause();
        submit(&backend, QueueKind::Compute, Vec::new(), 1);
        backend
            .queue(QueueKind::Graphics)
            .unwrap()
            .submit(SubmitBatch {
                commands: None,
                waits: vec![TimelinePoint::new(QueueKind::Compute, 1)],
                signal: 1,
                label: "consumer".to_string(),
            })
            .unwrap();
        backend.resume();

        let graphics = backend.queue(QueueKind::Graphics).unwrap();
        assert!(graphics.wait_value(1, Duration::from_secs(5)).unwrap());
        let order: Vec<_> = backend.executed_batches().iter().map(|b| b.queue).collect();
        assert_eq!(order, vec![QueueKind::Compute, QueueKind::Graphics]);
    }

    #[test]
    fn test_device_lost() {
        let backend = HeadlessBackend::new(HeadlessConfig::default());
        backend.lose_device();
        let queue = backend.queue(QueueKind::Graphics).unwrap();
        assert_eq!(queue.wait_value(1, Duration::from_secs(5)), Err(RhiError::DeviceLost));
        let batch = SubmitBatch {
            commands: None,
            waits: Vec::new(),
            signal: 1,
            label: String::new(),
        };
        assert_eq!(queue.submit(batch).unwrap_err(), RhiError::DeviceLost);
    }
}
