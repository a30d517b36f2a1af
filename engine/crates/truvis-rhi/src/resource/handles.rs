use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use slotmap::{Key, KeyData, new_key_type};

// 资源表内部使用的 key，包含 slot index 和 generation
new_key_type! {
    /// 资源表的 slot key
    pub struct SlotKey;
}

/// 资源的种类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Buffer,
    Image,
    Sampler,
    Pipeline,
    DescriptorSet,
}

/// 作为 `Handle<T>` 泛型参数的资源种类标记
pub trait ResourceKind: 'static {
    const TYPE: ResourceType;
}

/// Buffer 标记类型
pub enum Buffer {}
/// Image 标记类型
pub enum Image {}
/// Sampler 标记类型
pub enum Sampler {}
/// Pipeline 标记类型
pub enum Pipeline {}
/// DescriptorSet 标记类型
pub enum DescriptorSet {}

impl ResourceKind for Buffer {
    const TYPE: ResourceType = ResourceType::Buffer;
}
impl ResourceKind for Image {
    const TYPE: ResourceType = ResourceType::Image;
}
impl ResourceKind for Sampler {
    const TYPE: ResourceType = ResourceType::Sampler;
}
impl ResourceKind for Pipeline {
    const TYPE: ResourceType = ResourceType::Pipeline;
}
impl ResourceKind for DescriptorSet {
    const TYPE: ResourceType = ResourceType::DescriptorSet;
}

/// 强类型的资源句柄：{index, generation}
///
/// 句柄只是一个可以随意复制的值，不持有资源的所有权。
/// 资源销毁后 slot 的 generation 会前进，旧的句柄再去 resolve 会得到 `StaleHandle`。
pub struct Handle<T: ResourceKind> {
    key: SlotKey,
    _marker: PhantomData<fn() -> T>,
}

pub type BufferHandle = Handle<Buffer>;
pub type ImageHandle = Handle<Image>;
pub type SamplerHandle = Handle<Sampler>;
pub type PipelineHandle = Handle<Pipeline>;
pub type DescriptorSetHandle = Handle<DescriptorSet>;

// new & init
impl<T: ResourceKind> Handle<T> {
    #[inline]
    pub(crate) fn from_key(key: SlotKey) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }

    /// 由 index 和 generation 直接拼出一个句柄，主要用于调试和测试
    #[inline]
    pub fn from_raw_parts(index: u32, generation: u32) -> Self {
        Self::from_key(SlotKey::from(KeyData::from_ffi(((generation as u64) << 32) | index as u64)))
    }

    /// 一个永远无法 resolve 成功的句柄
    #[inline]
    pub fn null() -> Self {
        Self::from_key(SlotKey::null())
    }
}
// getters
impl<T: ResourceKind> Handle<T> {
    #[inline]
    pub(crate) fn key(&self) -> SlotKey {
        self.key
    }

    #[inline]
    pub fn index(&self) -> u32 {
        key_index(self.key)
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        key_generation(self.key)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.key.is_null()
    }

    #[inline]
    pub fn raw(&self) -> RawHandle {
        RawHandle {
            key: self.key,
            ty: T::TYPE,
        }
    }
}

impl<T: ResourceKind> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ResourceKind> Copy for Handle<T> {}

impl<T: ResourceKind> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T: ResourceKind> Eq for Handle<T> {}

impl<T: ResourceKind> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl<T: ResourceKind> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({}v{})", T::TYPE, self.index(), self.generation())
    }
}

impl<T: ResourceKind> From<Handle<T>> for RawHandle {
    #[inline]
    fn from(handle: Handle<T>) -> Self {
        handle.raw()
    }
}

/// 擦除了类型的句柄，用于访问声明和同步推导
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle {
    key: SlotKey,
    ty: ResourceType,
}

impl RawHandle {
    #[inline]
    pub(crate) fn from_key(key: SlotKey, ty: ResourceType) -> Self {
        Self { key, ty }
    }

    #[inline]
    pub(crate) fn key(&self) -> SlotKey {
        self.key
    }

    #[inline]
    pub fn resource_type(&self) -> ResourceType {
        self.ty
    }

    #[inline]
    pub fn index(&self) -> u32 {
        key_index(self.key)
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        key_generation(self.key)
    }

    #[inline]
    pub fn is_image(&self) -> bool {
        self.ty == ResourceType::Image
    }

    /// 转回强类型句柄，种类不匹配时返回 None
    #[inline]
    pub fn typed<T: ResourceKind>(&self) -> Option<Handle<T>> {
        (self.ty == T::TYPE).then(|| Handle::from_key(self.key))
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({}v{})", self.ty, self.index(), self.generation())
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[inline]
fn key_index(key: SlotKey) -> u32 {
    (key.data().as_ffi() & 0xffff_ffff) as u32
}

#[inline]
fn key_generation(key: SlotKey) -> u32 {
    (key.data().as_ffi() >> 32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_parts_round_trip() {
        let handle = BufferHandle::from_raw_parts(7, 3);
        assert_eq!(handle.index(), 7);
        assert_eq!(handle.generation(), 3);
        assert_eq!(handle.raw().resource_type(), ResourceType::Buffer);
    }

    #[test]
    fn test_typed_conversion() {
        let raw = ImageHandle::from_raw_parts(1, 1).raw();
        assert!(raw.typed::<Image>().is_some());
        assert!(raw.typed::<Buffer>().is_none());
    }

    #[test]
    fn test_null_handle() {
        let handle = SamplerHandle::null();
        assert!(handle.is_null());
        assert_eq!(handle.index(), u32::MAX);
    }
}
