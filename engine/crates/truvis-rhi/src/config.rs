//! RHI 的配置，从 toml 文件中读取
//!
//! 所有字段都有默认值，配置文件中只需要写需要覆盖的部分：
//!
//! ```toml
//! [frames]
//! frames_in_flight = 3
//!
//! [sync]
//! granularity = "byte-range"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{RhiError, RhiResult};
use crate::swapchain::PresentMode;
use crate::sync::SyncGranularity;

/// 同时在飞的帧数的上限
pub const MAX_FRAMES_IN_FLIGHT: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RhiConfig {
    pub frames: FrameConfig,
    pub resources: ResourceConfig,
    pub allocator: AllocatorConfig,
    pub staging: StagingConfig,
    pub sync: SyncConfig,
    pub swapchain: SwapchainConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FrameConfig {
    /// 同时在飞的帧数 N
    pub frames_in_flight: usize,
    /// begin_frame 等待 N 帧之前的 fence 的最长时间
    pub fence_timeout_ms: u64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            fence_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceConfig {
    /// 资源表的容量上限，None 表示不限制
    pub table_capacity: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorConfig {
    /// device local 的 backing block 大小，必须是 2 的幂
    pub device_local_block_size: u64,
    /// host visible 的 backing block 大小，必须是 2 的幂
    pub host_visible_block_size: u64,
    /// 最小的 size class
    pub min_allocation: u64,
    /// 每个 pool 只保留一个空闲的 backing block，其余的归还给后端
    pub release_empty_blocks: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            device_local_block_size: 64 << 20,
            host_visible_block_size: 16 << 20,
            min_allocation: 256,
            release_empty_blocks: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StagingConfig {
    /// 每个 staging chunk 的大小，超过该大小的上传会单独创建 chunk
    pub chunk_size: u64,
    /// staging 中每次分配的对齐
    pub alignment: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4 << 20,
            alignment: 16,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub granularity: SyncGranularity,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwapchainConfig {
    pub present_mode: PresentMode,
    pub image_count: u32,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            present_mode: PresentMode::Fifo,
            image_count: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebugConfig {
    /// 打开后端的 validation
    pub validation: bool,
    /// 在每个 stream 的首尾插入 debug label
    pub label_streams: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            label_streams: true,
        }
    }
}

// load
impl RhiConfig {
    pub fn from_toml_str(content: &str) -> RhiResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| RhiError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件读取配置，文件不存在时使用默认值
    pub fn load(path: impl AsRef<Path>) -> RhiResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("rhi config not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        log::info!("rhi config loaded from {:?}", path);
        Ok(config)
    }
}
// builder
impl RhiConfig {
    #[inline]
    pub fn with_frames_in_flight(mut self, frames_in_flight: usize) -> Self {
        self.frames.frames_in_flight = frames_in_flight;
        self
    }

    #[inline]
    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.frames.fence_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[inline]
    pub fn with_table_capacity(mut self, capacity: u32) -> Self {
        self.resources.table_capacity = Some(capacity);
        self
    }

    #[inline]
    pub fn with_granularity(mut self, granularity: SyncGranularity) -> Self {
        self.sync.granularity = granularity;
        self
    }
}
// getters
impl RhiConfig {
    #[inline]
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.frames.fence_timeout_ms)
    }

    pub fn validate(&self) -> RhiResult<()> {
        let fif = self.frames.frames_in_flight;
        if fif == 0 || fif > MAX_FRAMES_IN_FLIGHT {
            return Err(RhiError::Config(format!(
                "frames_in_flight must be in 1..={MAX_FRAMES_IN_FLIGHT}, got {fif}"
            )));
        }
        if self.resources.table_capacity == Some(0) {
            return Err(RhiError::Config("table_capacity must be greater than 0".to_string()));
        }

        let alloc = &self.allocator;
        for (name, size) in [
            ("device_local_block_size", alloc.device_local_block_size),
            ("host_visible_block_size", alloc.host_visible_block_size),
            ("min_allocation", alloc.min_allocation),
        ] {
            if !size.is_power_of_two() {
                return Err(RhiError::Config(format!("{name} must be a power of two, got {size}")));
            }
        }
        if alloc.min_allocation > alloc.host_visible_block_size || alloc.min_allocation > alloc.device_local_block_size {
            return Err(RhiError::Config("min_allocation is larger than a backing block".to_string()));
        }

        if self.staging.chunk_size == 0 || !self.staging.alignment.is_power_of_two() {
            return Err(RhiError::Config("staging chunk_size must be > 0 and alignment a power of two".to_string()));
        }
        if self.swapchain.image_count == 0 {
            return Err(RhiError::Config("swapchain image_count must be greater than 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RhiConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames.frames_in_flight, 2);
        assert_eq!(config.sync.granularity, SyncGranularity::WholeResource);
    }

    #[test]
    fn test_partial_toml() {
        let config = RhiConfig::from_toml_str(
            r#"
            [frames]
            frames_in_flight = 3

            [sync]
            granularity = "byte-range"

            [swapchain]
            present_mode = "mailbox"
            "#,
        )
        .unwrap();

        assert_eq!(config.frames.frames_in_flight, 3);
        assert_eq!(config.frames.fence_timeout_ms, 5000);
        assert_eq!(config.sync.granularity, SyncGranularity::ByteRange);
        assert_eq!(config.swapchain.present_mode, PresentMode::Mailbox);
    }

    #[test]
    fn test_reject_invalid() {
        assert!(matches!(
            RhiConfig::from_toml_str("[frames]\nframes_in_flight = 0"),
            Err(RhiError::Config(_))
        ));
        assert!(matches!(
            RhiConfig::from_toml_str("[allocator]\ndevice_local_block_size = 1000"),
            Err(RhiError::Config(_))
        ));
        assert!(matches!(RhiConfig::from_toml_str("[frames]\nunknown = 1"), Err(RhiError::Config(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = RhiConfig::load("this/path/does/not/exist.toml").unwrap();
        assert_eq!(config, RhiConfig::default());
    }
}
