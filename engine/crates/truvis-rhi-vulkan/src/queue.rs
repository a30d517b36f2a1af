use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use itertools::Itertools;
use parking_lot::Mutex;
use truvis_rhi::backend::{BackendQueue, SubmitBatch};
use truvis_rhi::{QueueKind, RhiError, RhiResult, TimelinePoint};

use crate::backend::VulkanShared;
use crate::encoder::VulkanCommands;

/// 一个 RHI queue 对应的 vk::Queue 和 timeline semaphore
pub(crate) struct QueueSlot {
    pub(crate) kind: QueueKind,
    pub(crate) family_index: u32,
    /// vkQueueSubmit 和 vkQueuePresent 需要外部同步
    pub(crate) queue: Mutex<vk::Queue>,
    pub(crate) timeline: vk::Semaphore,
}

pub struct VulkanQueue {
    shared: Arc<VulkanShared>,
    index: usize,
}

impl VulkanQueue {
    pub(crate) fn new(shared: Arc<VulkanShared>, index: usize) -> Self {
        Self { shared, index }
    }

    #[inline]
    fn slot(&self) -> &QueueSlot {
        &self.shared.queues[self.index]
    }
}

impl BackendQueue for VulkanQueue {
    fn kind(&self) -> QueueKind {
        self.slot().kind
    }

    fn submit(&self, batch: SubmitBatch) -> RhiResult<()> {
        let _span = truvis_rhi::rhi_span!("VulkanQueue::submit");
        self.shared.check_alive()?;
        let slot = self.slot();

        let command_buffer = match batch.commands {
            Some(encoded) => match encoded.downcast::<VulkanCommands>() {
                Ok(commands) => Some(commands.command_buffer),
                Err(_) => return Err(RhiError::Backend("commands were not encoded by the vulkan backend".into())),
            },
            None => None,
        };

        let mut wait_infos = Vec::with_capacity(batch.waits.len());
        for wait in &batch.waits {
            let semaphore = self.shared.timeline_of(wait.queue).ok_or(RhiError::QueueUnavailable(wait.queue))?;
            wait_infos.push(
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore)
                    .value(wait.value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
            );
        }
        let signal_infos = [vk::SemaphoreSubmitInfo::default()
            .semaphore(slot.timeline)
            .value(batch.signal)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let command_infos = command_buffer
            .iter()
            .map(|&cmd| vk::CommandBufferSubmitInfo::default().command_buffer(cmd))
            .collect_vec();

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(&command_infos)
            .signal_semaphore_infos(&signal_infos);

        log::trace!("{} queue submit {}: signal {}", slot.kind, batch.label, batch.signal);
        let queue = slot.queue.lock();
        let result = unsafe { self.shared.device.device.queue_submit2(*queue, &[submit_info], vk::Fence::null()) };
        self.shared.observe(result, "queue submit")
    }

    fn completed_value(&self) -> u64 {
        let result = unsafe { self.shared.device.device.get_semaphore_counter_value(self.slot().timeline) };
        self.shared.observe(result, "get semaphore counter").unwrap_or(0)
    }

    fn wait_value(&self, value: u64, timeout: Duration) -> RhiResult<bool> {
        self.shared.wait_points(&[TimelinePoint::new(self.kind(), value)], timeout)
    }
}
