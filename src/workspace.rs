use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::RequestError;

/// 删除一个目录及其全部内容，失败只记录日志
///
/// 清理失败不会向上传播：一个维度的清理失败不能影响其他维度，
/// 也不能影响响应的返回。
pub fn cleanup_directory(dir: &Path) {
    if dir.exists() {
        match std::fs::remove_dir_all(dir) {
            Ok(_) => debug!("已清理目录: {}", dir.display()),
            Err(e) => warn!("清理目录失败 {}: {}", dir.display(), e),
        }
    }
}

/// 单个请求的临时工作区
///
/// 上传的视频、采样帧目录、OpenPose 输出目录和临时音频文件都放在
/// 同一个以请求 ID 命名的目录下。工作区在 Drop 时整体删除，
/// 无论请求正常返回、维度失败还是提前退出。
pub struct RequestWorkspace {
    request_id: String,
    root: PathBuf,
}

impl RequestWorkspace {
    /// 在 base 下创建一个以 UUID 命名的工作区目录
    pub fn create(base: &Path) -> Result<Self, RequestError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let root = base.join(&request_id);
        std::fs::create_dir_all(&root)
            .map_err(|e| RequestError::Internal(format!("创建临时工作区失败: {}", e)))?;
        Ok(Self { request_id, root })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 上传视频的落盘路径
    pub fn video_path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    /// 采样帧输出目录（表情分析的输入）
    pub fn frames_dir(&self) -> PathBuf {
        self.root.join("frames")
    }

    /// OpenPose 的 JSON 输出目录
    pub fn openpose_dir(&self) -> PathBuf {
        self.root.join("openpose_output")
    }

    /// 提取出的临时音频文件路径
    pub fn audio_path(&self) -> PathBuf {
        self.root.join("audio.wav")
    }
}

impl Drop for RequestWorkspace {
    fn drop(&mut self) {
        cleanup_directory(&self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_removed_on_drop() {
        let base = std::env::temp_dir().join("presentation-analysis-test");
        let root = {
            let ws = RequestWorkspace::create(&base).unwrap();
            std::fs::create_dir_all(ws.frames_dir()).unwrap();
            std::fs::write(ws.audio_path(), b"xx").unwrap();
            assert!(ws.root().exists());
            ws.root().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[test]
    fn test_workspace_paths_under_root() {
        let base = std::env::temp_dir().join("presentation-analysis-test");
        let ws = RequestWorkspace::create(&base).unwrap();
        assert!(ws.frames_dir().starts_with(ws.root()));
        assert!(ws.openpose_dir().starts_with(ws.root()));
        assert!(ws.audio_path().starts_with(ws.root()));
        assert!(!ws.request_id().is_empty());
    }

    #[test]
    fn test_cleanup_missing_directory_is_noop() {
        let dir = std::env::temp_dir().join(format!("not-there-{}", uuid::Uuid::new_v4()));
        cleanup_directory(&dir);
    }
}
