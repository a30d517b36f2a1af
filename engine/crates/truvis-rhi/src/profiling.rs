//! 性能分析的 scope 标记
//!
//! 只有在打开 `profile-with-tracy` 并且 tracy client 已经启动时才会真正发出 span，
//! 其余情况下 `rhi_span!` 什么都不做，不影响任何行为。

/// 创建一个 tracy span，返回值需要绑定到变量上以保持 scope
///
/// ```ignore
/// let _span = truvis_rhi::rhi_span!("Device::submit_frame");
/// ```
#[macro_export]
macro_rules! rhi_span {
    ($name:expr) => {
        $crate::profiling::tracy_client::Client::running()
            .map(|client| client.span($crate::profiling::tracy_client::span_location!($name), 0))
    };
}

pub use tracy_client;

/// 在 tracy 中标记一帧结束
#[inline]
pub fn frame_mark() {
    if let Some(client) = tracy_client::Client::running() {
        client.frame_mark();
    }
}
