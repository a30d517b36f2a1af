use slotmap::SlotMap;

use crate::error::{RhiError, RhiResult};
use crate::frame::FrameIndex;
use crate::resource::Resource;
use crate::resource::desc::{BufferDesc, DescriptorSetDesc, ImageDesc, PipelineDesc};
use crate::resource::handles::{
    BufferHandle, DescriptorSetHandle, Handle, ImageHandle, PipelineHandle, RawHandle, ResourceKind, SlotKey,
};

/// 所有 GPU 资源的存储
///
/// 使用 SlotMap 存储，句柄中带有 generation，资源回收之后 slot 的 generation 前进，
/// 旧句柄 resolve 时得到 `StaleHandle`。
///
/// 销毁是延迟的：
/// 1. `destroy` 只做标记，之后句柄立即失效
/// 2. `collect_retired` 在引用它的最后一帧完成之后才把资源从表中移除
pub struct ResourceTable {
    slots: SlotMap<SlotKey, Resource>,
    capacity: Option<u32>,

    /// 曾经发出过的 slot 数量，index 不小于它的句柄一定是伪造的
    issued_slots: u32,
    pending_destroy: usize,
}
// new & init
impl ResourceTable {
    pub fn new(capacity: Option<u32>) -> Self {
        Self {
            slots: SlotMap::with_key(),
            capacity,
            issued_slots: 0,
            pending_destroy: 0,
        }
    }
}
// getters
impl ResourceTable {
    /// 没有被销毁的资源数量
    #[inline]
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.pending_destroy
    }

    /// 等待回收的资源数量
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending_destroy
    }

    #[inline]
    pub fn capacity(&self) -> Option<u32> {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawHandle, &Resource)> {
        self.slots
            .iter()
            .filter(|(_, r)| !r.pending_destroy)
            .map(|(key, r)| (raw_handle(key, r), r))
    }
}
// create & resolve
impl ResourceTable {
    /// 插入一个资源，永远不会阻塞
    ///
    /// 只有设置了容量并且已满时返回 `OutOfTableSpace`，等待回收的资源仍然占用 slot。
    pub fn insert<T: ResourceKind>(&mut self, resource: Resource) -> RhiResult<Handle<T>> {
        debug_assert_eq!(resource.resource_type(), T::TYPE);
        if let Some(capacity) = self.capacity {
            if self.slots.len() >= capacity as usize {
                return Err(RhiError::OutOfTableSpace { capacity });
            }
        }

        let key = self.slots.insert(resource);
        let handle = Handle::<T>::from_key(key);
        self.issued_slots = self.issued_slots.max(handle.index() + 1);
        Ok(handle)
    }

    #[inline]
    pub fn resolve<T: ResourceKind>(&self, handle: Handle<T>) -> RhiResult<&Resource> {
        self.resolve_raw(handle.raw())
    }

    /// 已经销毁（即使还没有回收）的句柄返回 `StaleHandle`
    pub fn resolve_raw(&self, handle: RawHandle) -> RhiResult<&Resource> {
        let resource = self.lookup(handle)?;
        if resource.pending_destroy {
            return Err(stale(handle));
        }
        Ok(resource)
    }

    pub fn buffer(&self, handle: BufferHandle) -> RhiResult<(&Resource, &BufferDesc)> {
        let resource = self.resolve(handle)?;
        let desc = resource.as_buffer().ok_or(RhiError::InvalidHandle { index: handle.index() })?;
        Ok((resource, desc))
    }

    pub fn image(&self, handle: ImageHandle) -> RhiResult<(&Resource, &ImageDesc)> {
        let resource = self.resolve(handle)?;
        let desc = resource.as_image().ok_or(RhiError::InvalidHandle { index: handle.index() })?;
        Ok((resource, desc))
    }

    pub fn pipeline(&self, handle: PipelineHandle) -> RhiResult<&PipelineDesc> {
        let resource = self.resolve(handle)?;
        resource.as_pipeline().ok_or(RhiError::InvalidHandle { index: handle.index() })
    }

    pub fn descriptor_set(&self, handle: DescriptorSetHandle) -> RhiResult<&DescriptorSetDesc> {
        let resource = self.resolve(handle)?;
        resource.as_descriptor_set().ok_or(RhiError::InvalidHandle { index: handle.index() })
    }

    /// 提交时使用：在同一帧中先录制、后销毁的资源仍然可以被提交
    pub(crate) fn resolve_for_submit(&self, handle: RawHandle) -> RhiResult<&Resource> {
        self.lookup(handle)
    }

    pub(crate) fn resolve_for_submit_mut(&mut self, handle: RawHandle) -> RhiResult<&mut Resource> {
        let issued_slots = self.issued_slots;
        match self.slots.get_mut(handle.key()) {
            Some(resource) if resource.resource_type() != handle.resource_type() => Err(RhiError::InvalidHandle {
                index: handle.index(),
            }),
            Some(resource) => Ok(resource),
            None => Err(missing(handle, issued_slots)),
        }
    }

    fn lookup(&self, handle: RawHandle) -> RhiResult<&Resource> {
        match self.slots.get(handle.key()) {
            Some(resource) if resource.resource_type() != handle.resource_type() => Err(RhiError::InvalidHandle {
                index: handle.index(),
            }),
            Some(resource) => Ok(resource),
            None => Err(missing(handle, self.issued_slots)),
        }
    }
}
// destroy
impl ResourceTable {
    /// 标记为等待回收
    ///
    /// `hold_until` 是当前正在录制的帧，该帧中录制的命令仍然可能引用这个资源。
    pub fn destroy(&mut self, handle: RawHandle, hold_until: Option<FrameIndex>) -> RhiResult<()> {
        self.resolve_raw(handle)?;
        let resource = self.resolve_for_submit_mut(handle)?;
        resource.pending_destroy = true;
        if let Some(frame) = hold_until {
            resource.stamp(frame);
        }
        log::debug!("resource {} ({}) marked for destroy", handle, resource.label());
        self.pending_destroy += 1;
        Ok(())
    }

    /// 移除所有已经可以回收的资源，返回给调用者释放后端对象和内存
    pub fn collect_retired(&mut self, completed: Option<FrameIndex>) -> Vec<(RawHandle, Resource)> {
        let _span = crate::rhi_span!("ResourceTable::collect_retired");
        if self.pending_destroy == 0 {
            return Vec::new();
        }

        let keys: Vec<SlotKey> = self
            .slots
            .iter()
            .filter(|(_, r)| r.pending_destroy && r.is_retired(completed))
            .map(|(key, _)| key)
            .collect();

        let mut retired = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(resource) = self.slots.remove(key) {
                retired.push((raw_handle(key, &resource), resource));
            }
        }
        self.pending_destroy -= retired.len();
        retired
    }

    /// 移除所有资源，只在 Device 销毁时使用
    pub(crate) fn drain_all(&mut self) -> Vec<(RawHandle, Resource)> {
        self.pending_destroy = 0;
        self.slots
            .drain()
            .map(|(key, resource)| (raw_handle(key, &resource), resource))
            .collect()
    }
}

#[inline]
fn raw_handle(key: SlotKey, resource: &Resource) -> RawHandle {
    RawHandle::from_key(key, resource.resource_type())
}

#[inline]
fn stale(handle: RawHandle) -> RhiError {
    RhiError::StaleHandle {
        index: handle.index(),
        generation: handle.generation(),
    }
}

#[inline]
fn missing(handle: RawHandle, issued_slots: u32) -> RhiError {
    if handle.index() >= issued_slots {
        RhiError::InvalidHandle { index: handle.index() }
    } else {
        stale(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ObjectId;
    use crate::resource::ResourceData;
    use crate::resource::desc::{BufferDesc, BufferUsage, ImageDesc, ImageUsage, MemoryLocality, Format};
    use crate::resource::handles::{Buffer, BufferHandle, Image, ImageHandle};

    fn buffer(label: &str) -> Resource {
        Resource::new(
            ResourceData::Buffer(BufferDesc::new(256, BufferUsage::STORAGE, MemoryLocality::DeviceLocal, label)),
            ObjectId(1),
            None,
        )
    }

    #[test]
    fn test_insert_and_resolve() {
        let mut table = ResourceTable::new(None);
        let handle = table.insert::<Buffer>(buffer("a")).unwrap();
        assert_eq!(table.resolve(handle).unwrap().label(), "a");
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn test_destroyed_handle_is_stale_immediately() {
        let mut table = ResourceTable::new(None);
        let handle = table.insert::<Buffer>(buffer("a")).unwrap();
        table.destroy(handle.raw(), None).unwrap();

        assert!(matches!(table.resolve(handle), Err(RhiError::StaleHandle { .. })));
        assert!(matches!(table.destroy(handle.raw(), None), Err(RhiError::StaleHandle { .. })));
        // 还没有回收
        assert_eq!(table.pending_count(), 1);
        assert!(table.resolve_for_submit(handle.raw()).is_ok());
    }

    #[test]
    fn test_never_issued_index_is_invalid() {
        let mut table = ResourceTable::new(None);
        table.insert::<Buffer>(buffer("a")).unwrap();
        assert_eq!(
            table.resolve(BufferHandle::from_raw_parts(5, 1)).unwrap_err(),
            RhiError::InvalidHandle { index: 5 }
        );
        assert!(matches!(table.resolve(BufferHandle::null()), Err(RhiError::InvalidHandle { .. })));
    }

    #[test]
    fn test_kind_mismatch_is_invalid() {
        let mut table = ResourceTable::new(None);
        let handle = table.insert::<Buffer>(buffer("a")).unwrap();
        let forged = ImageHandle::from_raw_parts(handle.index(), handle.generation());
        assert!(matches!(table.resolve(forged), Err(RhiError::InvalidHandle { .. })));
    }

    #[test]
    fn test_slot_reuse_advances_generation() {
        let mut table = ResourceTable::new(None);
        let old = table.insert::<Buffer>(buffer("old")).unwrap();
        table.destroy(old.raw(), None).unwrap();
        assert_eq!(table.collect_retired(None).len(), 1);

        let new = table.insert::<Buffer>(buffer("new")).unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());
        assert!(matches!(table.resolve(old), Err(RhiError::StaleHandle { .. })));
        assert_eq!(table.resolve(new).unwrap().label(), "new");
    }

    #[test]
    fn test_capacity() {
        let mut table = ResourceTable::new(Some(2));
        let a = table.insert::<Buffer>(buffer("a")).unwrap();
        table.insert::<Buffer>(buffer("b")).unwrap();
        assert_eq!(
            table.insert::<Buffer>(buffer("c")).unwrap_err(),
            RhiError::OutOfTableSpace { capacity: 2 }
        );

        // 等待回收的资源仍然占用 slot
        table.destroy(a.raw(), Some(FrameIndex(0))).unwrap();
        assert!(table.insert::<Buffer>(buffer("c")).is_err());
        table.collect_retired(Some(FrameIndex(0)));
        assert!(table.insert::<Buffer>(buffer("c")).is_ok());
    }

    #[test]
    fn test_collect_waits_for_last_used_frame() {
        let mut table = ResourceTable::new(None);
        let handle = table.insert::<Buffer>(buffer("a")).unwrap();
        table.resolve_for_submit_mut(handle.raw()).unwrap().stamp(FrameIndex(4));
        table.destroy(handle.raw(), Some(FrameIndex(2))).unwrap();

        assert!(table.collect_retired(None).is_empty());
        assert!(table.collect_retired(Some(FrameIndex(3))).is_empty());
        let retired = table.collect_retired(Some(FrameIndex(4)));
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].0, handle.raw());
        // 幂等
        assert!(table.collect_retired(Some(FrameIndex(4))).is_empty());
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn test_iter_skips_pending() {
        let mut table = ResourceTable::new(None);
        let a = table.insert::<Buffer>(buffer("a")).unwrap();
        let image = Resource::new(
            ResourceData::Image(ImageDesc::new_2d(4, 4, Format::Rgba8Unorm, ImageUsage::SAMPLED, "img")),
            ObjectId(2),
            None,
        );
        let b = table.insert::<Image>(image).unwrap();
        table.destroy(a.raw(), None).unwrap();

        let live: Vec<_> = table.iter().map(|(h, _)| h).collect();
        assert_eq!(live, vec![b.raw()]);
    }
}
