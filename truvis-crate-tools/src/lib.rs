//! 在 truvis-rhi 的各个 crate 之间共享的工具
//!
//! - `init_log`：带颜色、线程名和源码位置的 env_logger 格式
//! - `resource::TruvisPath`：基于工作区根目录的配置和输出路径

pub mod init_log;
pub mod resource;
