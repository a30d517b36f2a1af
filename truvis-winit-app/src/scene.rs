use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use truvis_rhi::commands::ClearValue;
use truvis_rhi::resource::desc::{BufferDesc, BufferUsage, MemoryLocality};
use truvis_rhi::swapchain::PresentTarget;
use truvis_rhi::{BufferHandle, CommandStream, Device, FrameIndex, Presenter, QueueKind, RhiResult, WorkerId};

/// 每一帧上传到 GPU 的参数
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct FrameParams {
    pub clear_color: Vec4,
    pub time: f32,
    pub delta_ms: f32,
    pub frame: u32,
    pub _padding: u32,
}

impl FrameParams {
    pub fn new(frame: FrameIndex, time: f32, delta_ms: f32) -> Self {
        Self {
            clear_color: Self::color_at(time),
            time,
            delta_ms,
            frame: frame.0 as u32,
            _padding: 0,
        }
    }

    /// 随时间变化的背景色
    pub fn color_at(time: f32) -> Vec4 {
        let phase = Vec3::new(0.0, 2.094, 4.189);
        let wave = Vec3::splat(time) + phase;
        let rgb = Vec3::new(wave.x.sin(), wave.y.sin(), wave.z.sin()) * 0.5 + Vec3::splat(0.5);
        rgb.extend(1.0)
    }
}

/// 演示场景
///
/// 每一帧由多个 worker 并行录制：
/// - upload worker 通过 staging belt 上传 `FrameParams`（有 transfer queue 时在 transfer queue 上）
/// - 其余 worker 各自写 scratch buffer 中属于自己的区域（有 compute queue 时在 compute queue 上）
/// - 调用线程把参数复制到 history ring，清除呈现目标并声明呈现
pub struct DemoScene {
    params: BufferHandle,
    history: BufferHandle,
    scratch: BufferHandle,

    workers: usize,
}

// new & init
impl DemoScene {
    pub const HISTORY_LEN: u64 = 8;
    pub const SCRATCH_PER_WORKER: u64 = 4096;

    /// workers 是额外录制线程的数量，至少为 1（upload worker）
    pub fn new(device: &Device, workers: usize) -> RhiResult<Self> {
        let workers = workers.max(1);
        let params_size = size_of::<FrameParams>() as u64;

        let params = device.create_buffer(BufferDesc::new(
            params_size,
            BufferUsage::UNIFORM | BufferUsage::TRANSFER_DST | BufferUsage::TRANSFER_SRC,
            MemoryLocality::DeviceLocal,
            "frame-params",
        ))?;
        let history = device.create_buffer(BufferDesc::new(
            params_size * Self::HISTORY_LEN,
            BufferUsage::TRANSFER_DST,
            MemoryLocality::HostVisible,
            "frame-params-history",
        ))?;
        let scratch = device.create_buffer(BufferDesc::new(
            Self::SCRATCH_PER_WORKER * workers as u64,
            BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
            MemoryLocality::DeviceLocal,
            "worker-scratch",
        ))?;

        log::info!("demo scene created with {} workers", workers);
        Ok(Self {
            params,
            history,
            scratch,
            workers,
        })
    }
}
// getters
impl DemoScene {
    #[inline]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// history ring 中 frame 对应的位置
    #[inline]
    pub fn history_offset(frame: FrameIndex) -> u64 {
        (frame.0 % Self::HISTORY_LEN) * size_of::<FrameParams>() as u64
    }

    /// 读回 frame 的参数，frame 必须已经完成
    pub fn read_history(&self, device: &Device, frame: FrameIndex) -> RhiResult<FrameParams> {
        let offset = Self::history_offset(frame);
        let bytes = device.read_buffer(self.history, offset..offset + size_of::<FrameParams>() as u64)?;
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }
}
// tools
impl DemoScene {
    /// 录制 frame 的所有 stream，返回值的顺序就是提交顺序
    pub fn record_frame(
        &self,
        device: &Device,
        frame: FrameIndex,
        params: &FrameParams,
        presenter: &dyn Presenter,
        target: &PresentTarget,
    ) -> RhiResult<Vec<CommandStream>> {
        let _span = tracy_client::span!("DemoScene::record_frame");
        let info = device.backend_info();
        let upload_queue = if info.has_queue(QueueKind::Transfer) { QueueKind::Transfer } else { QueueKind::Graphics };
        let scratch_queue = if info.has_queue(QueueKind::Compute) { QueueKind::Compute } else { QueueKind::Graphics };

        let mut streams = std::thread::scope(|s| -> RhiResult<Vec<(usize, CommandStream)>> {
            let (sender, receiver) = crossbeam_channel::unbounded();

            {
                let sender = sender.clone();
                s.spawn(move || {
                    let result = self.record_upload(device, frame, upload_queue, params);
                    // receiver 只会在 scope 结束后 drop
                    let _ = sender.send((0, result));
                });
            }
            for worker in 1..self.workers {
                let sender = sender.clone();
                s.spawn(move || {
                    let result = self.record_scratch(device, frame, scratch_queue, worker);
                    let _ = sender.send((worker, result));
                });
            }
            drop(sender);

            // 呈现相关的 stream 在调用线程上录制，presenter 不需要跨线程
            let present = self.record_present(device, frame, params, presenter, target);

            let mut streams = Vec::with_capacity(self.workers + 1);
            for (order, result) in receiver.iter() {
                streams.push((order, result?));
            }
            streams.push((self.workers, present?));
            Ok(streams)
        })?;

        streams.sort_by_key(|(order, _)| *order);
        Ok(streams.into_iter().map(|(_, stream)| stream).collect())
    }

    fn record_upload(
        &self,
        device: &Device,
        frame: FrameIndex,
        queue: QueueKind,
        params: &FrameParams,
    ) -> RhiResult<CommandStream> {
        let mut recorder = device.acquire_recorder(frame, WorkerId::current(), queue)?;
        let mut session = recorder.begin(frame)?;
        session.begin_label("upload frame params");
        session.upload_buffer(self.params, 0, bytemuck::bytes_of(params))?;
        session.end_label()?;
        session.end()
    }

    fn record_scratch(&self, device: &Device, frame: FrameIndex, queue: QueueKind, worker: usize) -> RhiResult<CommandStream> {
        let mut recorder = device.acquire_recorder(frame, WorkerId::current(), queue)?;
        let mut session = recorder.begin(frame)?;
        let offset = worker as u64 * Self::SCRATCH_PER_WORKER;
        session.fill_buffer(self.scratch, offset, Self::SCRATCH_PER_WORKER, frame.0 as u32 ^ worker as u32)?;
        session.end()
    }

    fn record_present(
        &self,
        device: &Device,
        frame: FrameIndex,
        params: &FrameParams,
        presenter: &dyn Presenter,
        target: &PresentTarget,
    ) -> RhiResult<CommandStream> {
        let mut recorder = device.acquire_recorder(frame, WorkerId::current(), QueueKind::Graphics)?;
        let mut session = recorder.begin(frame)?;

        let size = size_of::<FrameParams>() as u64;
        session.copy_buffer(self.params, 0, self.history, Self::history_offset(frame), size)?;

        let color = params.clear_color.to_array();
        session.begin_label("clear present target");
        session.clear_image(target.image, ClearValue::Color(color))?;
        session.end_label()?;

        presenter.record_present(&mut session, target)?;
        session.end()
    }
}
// destroy
impl DemoScene {
    pub fn destroy(self, device: &Device) {
        for buffer in [self.params, self.history, self.scratch] {
            if let Err(e) = device.destroy(buffer) {
                log::warn!("failed to destroy demo buffer {:?}: {}", buffer, e);
            }
        }
    }
}
