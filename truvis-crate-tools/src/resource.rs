use std::path::{Path, PathBuf};

/// 统一资源路径管理
///
/// 所有路径基于工作区根目录（通过 `CARGO_MANIFEST_DIR` 推导）。
///
/// # 使用示例
/// ```ignore
/// let config = TruvisPath::config_path("rhi.toml");     // config/rhi.toml
/// let frames = TruvisPath::output_path("frames");       // target/output/frames
/// ```
pub struct TruvisPath {}
// 核心路径
impl TruvisPath {
    /// 获取工作区根目录
    pub fn workspace_path() -> PathBuf {
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.parent().unwrap_or(manifest_dir).to_path_buf()
    }

    pub fn target_path() -> PathBuf {
        Self::workspace_path().join("target")
    }
}
// 根目录下
impl TruvisPath {
    pub fn engine_path() -> PathBuf {
        Self::workspace_path().join("engine")
    }

    /// `config/` 目录下的配置文件
    pub fn config_path(filename: &str) -> PathBuf {
        Self::workspace_path().join("config").join(filename)
    }

    /// 程序输出（例如离屏渲染的帧）所在的目录：`target/output/`
    pub fn output_path(dirname: &str) -> PathBuf {
        Self::target_path().join("output").join(dirname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_under_workspace() {
        let workspace = TruvisPath::workspace_path();
        assert!(workspace.join("truvis-crate-tools").join("Cargo.toml").exists());

        assert!(TruvisPath::output_path("frames").starts_with(TruvisPath::target_path()));
        assert!(TruvisPath::config_path("rhi.toml").ends_with("config/rhi.toml"));
        assert!(TruvisPath::engine_path().join("crates").join("truvis-rhi").exists());
    }
}
