use image::DynamicImage;
use std::path::Path;
use tracing::{info, warn};

use crate::error::ModalityError;
use crate::frame_sampler::FrameSampler;

/// 单个身体关键点
#[derive(Debug, Clone, Copy)]
pub struct Landmark {
    /// 归一化横坐标（0-1）
    pub x: f64,
    /// 归一化纵坐标（0-1）
    pub y: f64,
    /// 该关键点可见的置信度（0-1）
    pub visibility: f64,
}

/// 姿态可见性的聚合结果
#[derive(Debug, Clone)]
pub struct PostureResult {
    /// 有检测帧的平均可见度（0-1）
    pub average_visibility: f64,
    /// 0-100 得分
    pub score: i64,
}

/// 姿态分析的输出
///
/// NoDetections 表示逐帧跑完但没有任何帧检测到关键点
/// （得分按 0 记），与"分析器不可用"是不同的状态。
#[derive(Debug, Clone)]
pub enum PostureOutcome {
    Detected(PostureResult),
    NoDetections,
}

/// 人体关键点检测能力
///
/// 对单帧图像做检测；未检测到人体时返回 None。
pub trait LandmarkDetector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Option<Vec<Landmark>>, ModalityError>;
}

/// 对视频做姿态可见性分析
///
/// 直接从视频按帧率间隔独立采样（与帧采样器相同的间隔规则），
/// 对每个采样帧求关键点可见度的均值，最后对有检测的帧取平均。
pub fn analyze_video(
    detector: &dyn LandmarkDetector,
    video_path: &Path,
) -> Result<PostureOutcome, ModalityError> {
    let sampler = FrameSampler::new(video_path)?;

    let mut per_frame_visibility = Vec::new();
    let mut analyzed = 0usize;
    sampler.for_each_sampled(|index, img| {
        analyzed += 1;
        match detector.detect(img) {
            Ok(Some(landmarks)) if !landmarks.is_empty() => {
                let sum: f64 = landmarks.iter().map(|l| l.visibility).sum();
                per_frame_visibility.push(sum / landmarks.len() as f64);
            }
            // 未检测到关键点的帧不计入
            Ok(_) => {}
            Err(e) => {
                warn!("第 {} 个采样帧姿态检测失败，跳过: {}", index, e);
            }
        }
        Ok(())
    })?;

    info!(
        "姿态分析完成: {} 帧中 {} 帧有关键点",
        analyzed,
        per_frame_visibility.len()
    );

    Ok(aggregate_visibility(&per_frame_visibility))
}

/// 把逐帧可见度归并为一个姿态结果
pub fn aggregate_visibility(per_frame_visibility: &[f64]) -> PostureOutcome {
    if per_frame_visibility.is_empty() {
        return PostureOutcome::NoDetections;
    }

    let average =
        per_frame_visibility.iter().sum::<f64>() / per_frame_visibility.len() as f64;
    let score = ((average * 100.0).round() as i64).clamp(0, 100);

    PostureOutcome::Detected(PostureResult {
        average_visibility: average,
        score,
    })
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxLandmarkDetector;

#[cfg(feature = "onnx")]
mod onnx {
    use super::*;
    use image::imageops::FilterType;
    use ort::{session::builder::GraphOptimizationLevel, session::Session, value::Tensor};
    use std::sync::Mutex;

    /// MoveNet 单人模型输入尺寸
    const POSE_INPUT_SIZE: u32 = 192;
    /// 模型输出的关键点数量
    const NUM_KEYPOINTS: usize = 17;
    /// 整帧是否有人的判定阈值（最高关键点置信度）
    const PERSON_SCORE_THRESHOLD: f64 = 0.2;

    /// 基于 ONNX 的人体关键点检测器
    ///
    /// 使用 MoveNet SinglePose（movenet_singlepose_lightning.onnx），
    /// 输出 17 个关键点的 (y, x, score)，score 作为可见度。
    pub struct OnnxLandmarkDetector {
        session: Mutex<Session>,
    }

    impl OnnxLandmarkDetector {
        pub fn new(pose_model: impl AsRef<Path>) -> Result<Self, ModalityError> {
            let path = pose_model.as_ref();
            if !path.exists() {
                return Err(ModalityError::Unavailable(format!(
                    "模型文件不存在: {}",
                    path.display()
                )));
            }
            let session = Session::builder()
                .map_err(|e| ModalityError::Unavailable(e.to_string()))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|e| ModalityError::Unavailable(e.to_string()))?
                .with_intra_threads(1)
                .map_err(|e| ModalityError::Unavailable(e.to_string()))?
                .commit_from_file(path)
                .map_err(|e| ModalityError::Unavailable(e.to_string()))?;
            Ok(Self {
                session: Mutex::new(session),
            })
        }
    }

    impl LandmarkDetector for OnnxLandmarkDetector {
        fn detect(&self, image: &DynamicImage) -> Result<Option<Vec<Landmark>>, ModalityError> {
            let resized = image
                .resize_exact(POSE_INPUT_SIZE, POSE_INPUT_SIZE, FilterType::Triangle)
                .to_rgb8();

            // 输入 [1, 192, 192, 3]，int32 原始像素值
            let mut input = ndarray::Array4::<i32>::zeros((
                1,
                POSE_INPUT_SIZE as usize,
                POSE_INPUT_SIZE as usize,
                3,
            ));
            for (x, y, pixel) in resized.enumerate_pixels() {
                for c in 0..3 {
                    input[[0, y as usize, x as usize, c]] = pixel[c] as i32;
                }
            }

            let input_tensor = Tensor::from_array(input)
                .map_err(|e| ModalityError::Execution(format!("构建输入张量失败: {}", e)))?;

            let mut session = self
                .session
                .lock()
                .map_err(|_| ModalityError::Execution("姿态模型锁中毒".to_string()))?;
            let outputs = session
                .run(ort::inputs!["input" => input_tensor])
                .map_err(|e| ModalityError::Execution(format!("姿态推理失败: {}", e)))?;

            // 输出 [1, 1, 17, 3]，每个关键点为 (y, x, score)
            let (_, keypoints) = outputs
                .get("output_0")
                .ok_or_else(|| ModalityError::Execution("缺少关键点输出张量".to_string()))?
                .try_extract_tensor::<f32>()
                .map_err(|e| ModalityError::Execution(e.to_string()))?;

            if keypoints.len() < NUM_KEYPOINTS * 3 {
                return Err(ModalityError::Execution(format!(
                    "关键点输出维度不符: {}",
                    keypoints.len()
                )));
            }

            let landmarks: Vec<Landmark> = (0..NUM_KEYPOINTS)
                .map(|i| Landmark {
                    y: keypoints[i * 3] as f64,
                    x: keypoints[i * 3 + 1] as f64,
                    visibility: keypoints[i * 3 + 2] as f64,
                })
                .collect();

            // 所有关键点都低于阈值视为画面中没有人
            let max_score = landmarks
                .iter()
                .map(|l| l.visibility)
                .fold(f64::NEG_INFINITY, f64::max);
            if max_score < PERSON_SCORE_THRESHOLD {
                return Ok(None);
            }

            Ok(Some(landmarks))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_frames_is_no_detections() {
        assert!(matches!(
            aggregate_visibility(&[]),
            PostureOutcome::NoDetections
        ));
    }

    #[test]
    fn test_average_visibility_score() {
        let PostureOutcome::Detected(result) = aggregate_visibility(&[0.8, 0.6, 0.7]) else {
            panic!("应当有检测结果");
        };
        assert!((result.average_visibility - 0.7).abs() < 1e-9);
        assert_eq!(result.score, 70);
    }

    #[test]
    fn test_score_clamped() {
        // 可见度超出常规范围时得分也不会越界
        let PostureOutcome::Detected(result) = aggregate_visibility(&[1.5, 1.5]) else {
            panic!("应当有检测结果");
        };
        assert_eq!(result.score, 100);
    }

    #[test]
    fn test_single_frame() {
        let PostureOutcome::Detected(result) = aggregate_visibility(&[0.42]) else {
            panic!("应当有检测结果");
        };
        assert_eq!(result.score, 42);
    }
}
