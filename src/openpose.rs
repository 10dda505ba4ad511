use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::ModalityError;
use crate::workspace::cleanup_directory;

/// 外部命令的执行结果
#[derive(Debug)]
pub struct CommandOutput {
    /// 退出码（被信号终止时为 None）
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// 执行耗时
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }
}

/// 带超时地执行一个外部命令并捕获输出
pub async fn run_command(
    program: &Path,
    args: &[&str],
    timeout_secs: u64,
) -> Result<CommandOutput, ModalityError> {
    let start = Instant::now();
    let output_future = tokio::process::Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(Duration::from_secs(timeout_secs), output_future)
        .await
        .map_err(|_| ModalityError::Timeout(timeout_secs))?
        .map_err(|e| ModalityError::Execution(format!("启动外部进程失败: {}", e)))?;

    Ok(CommandOutput {
        status_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        elapsed: start.elapsed(),
    })
}

/// OpenPose 每帧输出文件的结构
///
/// 每个 JSON 文件对应一帧，people 为该帧检测到的人员列表（可为空）。
#[derive(Debug, Deserialize)]
pub struct PoseFrameFile {
    #[serde(default)]
    pub people: Vec<PosePerson>,
}

/// 单个人的关键点数据
#[derive(Debug, Deserialize)]
pub struct PosePerson {
    /// (x, y, confidence) 三元组展平后的数组
    #[serde(default)]
    pub pose_keypoints_2d: Vec<f64>,
}

/// 检测一致性的聚合结果
#[derive(Debug, Clone)]
pub struct PoseConsistencyResult {
    /// 读取的 JSON 文件数（即处理的帧数）
    pub frames_analyzed: usize,
    /// 至少检测到一个人的帧数
    pub frames_with_people: usize,
    /// 0-100 得分
    pub score: i64,
}

impl PoseConsistencyResult {
    /// 检测一致性：有人的帧占全部帧的比例
    pub fn consistency(&self) -> f64 {
        if self.frames_analyzed > 0 {
            self.frames_with_people as f64 / self.frames_analyzed as f64
        } else {
            0.0
        }
    }
}

/// 调用外部 OpenPose 进程分析视频
///
/// 可执行文件未配置或不存在时直接返回 Unavailable，不会启动进程。
/// 无论成功失败，输出目录都会在返回前删除。
pub async fn analyze_video(
    openpose_bin: Option<&Path>,
    video_path: &Path,
    output_dir: &Path,
    timeout_secs: u64,
) -> Result<PoseConsistencyResult, ModalityError> {
    let binary = openpose_bin.ok_or_else(|| {
        ModalityError::Unavailable("未配置 OpenPose 可执行文件路径".to_string())
    })?;
    if !binary.exists() {
        return Err(ModalityError::Unavailable(format!(
            "OpenPose 可执行文件不存在: {}",
            binary.display()
        )));
    }

    cleanup_directory(output_dir);
    std::fs::create_dir_all(output_dir)
        .map_err(|e| ModalityError::Execution(format!("创建 OpenPose 输出目录失败: {}", e)))?;

    let result = run_and_collect(binary, video_path, output_dir, timeout_secs).await;

    // 无论结果如何都清理输出目录
    cleanup_directory(output_dir);

    result
}

async fn run_and_collect(
    binary: &Path,
    video_path: &Path,
    output_dir: &Path,
    timeout_secs: u64,
) -> Result<PoseConsistencyResult, ModalityError> {
    let video = video_path.to_string_lossy();
    let out_dir = output_dir.to_string_lossy();
    let args = [
        "--video",
        video.as_ref(),
        "--write_json",
        out_dir.as_ref(),
        "--display",
        "0",
        "--render_pose",
        "0",
    ];

    info!("运行 OpenPose: {} {}", binary.display(), args.join(" "));
    let output = run_command(binary, &args, timeout_secs).await?;

    if !output.success() {
        return Err(ModalityError::Execution(format!(
            "OpenPose 退出码 {:?}，stderr: {}，stdout: {}",
            output.status_code,
            output.stderr.trim(),
            output.stdout.trim()
        )));
    }
    info!("OpenPose 运行完成，耗时 {:.2} 秒", output.elapsed.as_secs_f64());

    collect_frames(output_dir)
}

/// 按文件名顺序读取输出目录下的每帧 JSON，统计检测一致性
pub fn collect_frames(output_dir: &Path) -> Result<PoseConsistencyResult, ModalityError> {
    let entries = std::fs::read_dir(output_dir)
        .map_err(|e| ModalityError::Execution(format!("读取 OpenPose 输出目录失败: {}", e)))?;

    let mut json_files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("json"))
                .unwrap_or(false)
        })
        .collect();
    json_files.sort();

    if json_files.is_empty() {
        return Err(ModalityError::Execution(
            "OpenPose 没有产生任何输出文件".to_string(),
        ));
    }

    let mut frames_with_people = 0usize;
    for path in &json_files {
        let frame: PoseFrameFile = match std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()))
        {
            Ok(frame) => frame,
            Err(e) => {
                // 单个文件解析失败只跳过该文件
                warn!("解析 OpenPose 输出失败，跳过 {}: {}", path.display(), e);
                continue;
            }
        };
        if !frame.people.is_empty() {
            frames_with_people += 1;
        }
    }

    let frames_analyzed = json_files.len();
    let consistency = frames_with_people as f64 / frames_analyzed as f64;
    let score = ((consistency * 100.0).round() as i64).clamp(0, 100);

    info!(
        "OpenPose 分析完成: {}/{} 帧检测到人，得分 {}",
        frames_with_people, frames_analyzed, score
    );

    Ok(PoseConsistencyResult {
        frames_analyzed,
        frames_with_people,
        score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_output_dir() -> PathBuf {
        let dir = std::env::temp_dir()
            .join("presentation-analysis-test")
            .join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_collect_frames_consistency() {
        let dir = temp_output_dir();
        std::fs::write(
            dir.join("frame_000000000000_keypoints.json"),
            r#"{"people": [{"pose_keypoints_2d": [0.1, 0.2, 0.9]}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("frame_000000000001_keypoints.json"),
            r#"{"people": []}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("frame_000000000002_keypoints.json"),
            r#"{"people": [{}]}"#,
        )
        .unwrap();

        let result = collect_frames(&dir).unwrap();
        assert_eq!(result.frames_analyzed, 3);
        assert_eq!(result.frames_with_people, 2);
        // 2/3 的帧有人，得分 round(66.67) = 67
        assert_eq!(result.score, 67);

        cleanup_directory(&dir);
    }

    #[test]
    fn test_collect_frames_skips_malformed_file() {
        let dir = temp_output_dir();
        std::fs::write(dir.join("frame_0_keypoints.json"), "not valid json").unwrap();
        std::fs::write(
            dir.join("frame_1_keypoints.json"),
            r#"{"people": [{"pose_keypoints_2d": []}]}"#,
        )
        .unwrap();

        // 坏文件计入总数但不计入有人帧
        let result = collect_frames(&dir).unwrap();
        assert_eq!(result.frames_analyzed, 2);
        assert_eq!(result.frames_with_people, 1);
        assert_eq!(result.score, 50);

        cleanup_directory(&dir);
    }

    #[test]
    fn test_collect_frames_empty_dir_is_error() {
        let dir = temp_output_dir();
        assert!(matches!(
            collect_frames(&dir),
            Err(ModalityError::Execution(_))
        ));
        cleanup_directory(&dir);
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let dir = temp_output_dir();
        let result = analyze_video(
            None,
            Path::new("/tmp/video.mp4"),
            &dir,
            10,
        )
        .await;
        assert!(matches!(result, Err(ModalityError::Unavailable(_))));

        let result = analyze_video(
            Some(Path::new("/definitely/not/openpose")),
            Path::new("/tmp/video.mp4"),
            &dir,
            10,
        )
        .await;
        assert!(matches!(result, Err(ModalityError::Unavailable(_))));
        cleanup_directory(&dir);
    }

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let output = run_command(Path::new("/bin/echo"), &["hello"], 5)
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let result = run_command(Path::new("/bin/sleep"), &["5"], 1).await;
        assert!(matches!(result, Err(ModalityError::Timeout(1))));
    }
}
