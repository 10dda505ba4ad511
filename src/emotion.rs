use image::DynamicImage;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::error::ModalityError;

/// 表情标签（与分类模型输出对应的固定集合）
pub const EMOTION_LABELS: [&str; 7] = [
    "angry", "disgust", "fear", "happy", "sad", "surprise", "neutral",
];

/// 单帧的表情分类结果
#[derive(Debug, Clone)]
pub struct EmotionSample {
    /// 标签 -> 强度（0-100）
    pub scores: HashMap<String, f64>,
    /// 该帧的主导表情
    pub dominant: String,
}

/// 表情分析的聚合结果
#[derive(Debug, Clone)]
pub struct EmotionResult {
    /// 整段视频的主导表情
    pub dominant: String,
    /// 各标签的平均强度，按固定标签顺序
    pub avg_scores: Vec<(String, f64)>,
    /// 0-100 综合得分
    pub score: i64,
}

/// 表情分析的输出
///
/// NoDetections 表示分析跑完但没有任何帧检测到人脸，
/// 与"分析器不可用/从未尝试"是不同的状态。
#[derive(Debug, Clone)]
pub enum EmotionOutcome {
    Detected(EmotionResult),
    NoDetections,
}

/// 表情分类能力
///
/// 对单帧图像做分类；未检测到人脸时返回 None（该帧不计入分母）。
pub trait EmotionClassifier: Send + Sync {
    fn classify(&self, image: &DynamicImage) -> Result<Option<EmotionSample>, ModalityError>;
}

/// 对一个目录下的采样帧做表情分析并聚合
///
/// 帧的处理顺序与结果无关。读不出来的图片和分类出错的帧
/// 记日志后跳过，不影响其他帧。
pub fn analyze_frames(
    classifier: &dyn EmotionClassifier,
    frames_dir: &Path,
) -> Result<EmotionOutcome, ModalityError> {
    let entries = std::fs::read_dir(frames_dir)
        .map_err(|e| ModalityError::Execution(format!("读取帧目录失败: {}", e)))?;

    let mut frame_paths: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| {
                    let ext = ext.to_lowercase();
                    ext == "jpg" || ext == "jpeg" || ext == "png"
                })
                .unwrap_or(false)
        })
        .collect();
    frame_paths.sort();

    info!("开始分析 {} 帧的表情", frame_paths.len());

    let mut samples = Vec::new();
    for path in &frame_paths {
        let img = match image::open(path) {
            Ok(img) => img,
            Err(e) => {
                warn!("读取帧图片失败，跳过 {}: {}", path.display(), e);
                continue;
            }
        };
        match classifier.classify(&img) {
            // 未检测到人脸的帧静默跳过
            Ok(Some(sample)) => samples.push(sample),
            Ok(None) => {}
            Err(e) => {
                warn!("表情分类失败，跳过 {}: {}", path.display(), e);
            }
        }
    }

    Ok(aggregate_samples(&samples))
}

/// 把逐帧结果归并为一个表情分析结果
pub fn aggregate_samples(samples: &[EmotionSample]) -> EmotionOutcome {
    if samples.is_empty() {
        return EmotionOutcome::NoDetections;
    }

    // 各标签强度取全部有结果帧的平均
    let avg_scores: Vec<(String, f64)> = EMOTION_LABELS
        .iter()
        .map(|label| {
            let sum: f64 = samples
                .iter()
                .map(|s| s.scores.get(*label).copied().unwrap_or(0.0))
                .sum();
            ((*label).to_string(), sum / samples.len() as f64)
        })
        .collect();

    // 主导表情取逐帧主导标签中出现次数最多的；
    // 平局时取样本序列中首次出现的标签
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for sample in samples {
        match counts.iter_mut().find(|(l, _)| *l == sample.dominant) {
            Some((_, c)) => *c += 1,
            None => counts.push((sample.dominant.as_str(), 1)),
        }
    }
    let mut dominant = counts[0].0;
    let mut best = counts[0].1;
    for (label, count) in counts.iter().skip(1) {
        if *count > best {
            dominant = label;
            best = *count;
        }
    }

    let score = composite_score(&avg_scores);

    EmotionOutcome::Detected(EmotionResult {
        dominant: dominant.to_string(),
        avg_scores,
        score,
    })
}

/// 综合得分：正向 = happy + 0.7*neutral，负向 = sad + angry + fear，
/// 得分 = clamp(0, 100, round(0.6*正向 - 0.4*负向))
fn composite_score(avg_scores: &[(String, f64)]) -> i64 {
    let get = |label: &str| {
        avg_scores
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| *v)
            .unwrap_or(0.0)
    };
    let positive = get("happy") + 0.7 * get("neutral");
    let negative = get("sad") + get("angry") + get("fear");
    ((0.6 * positive - 0.4 * negative).round() as i64).clamp(0, 100)
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxEmotionClassifier;

#[cfg(feature = "onnx")]
mod onnx {
    use super::*;
    use image::imageops::FilterType;
    use ort::{session::builder::GraphOptimizationLevel, session::Session, value::Tensor};
    use std::sync::Mutex;

    /// UltraFace 检测输入尺寸（version-RFB-320）
    const FACE_INPUT_WIDTH: u32 = 320;
    const FACE_INPUT_HEIGHT: u32 = 240;
    /// 人脸置信度阈值
    const FACE_SCORE_THRESHOLD: f32 = 0.7;
    /// FER+ 输入尺寸（64x64 灰度）
    const EMOTION_INPUT_SIZE: u32 = 64;
    /// FER+ 输出类别，顺序与模型输出一致
    const FERPLUS_LABELS: [&str; 8] = [
        "neutral", "happy", "surprise", "sad", "angry", "disgust", "fear", "contempt",
    ];

    /// 基于 ONNX 的表情分类器
    ///
    /// 两阶段：UltraFace（version-RFB-320.onnx）检测人脸，
    /// 取置信度最高的人脸裁剪后送 FER+（emotion-ferplus-8.onnx）分类。
    /// 模型进程启动时加载一次，Session 推理需要独占，用锁保护。
    pub struct OnnxEmotionClassifier {
        face_session: Mutex<Session>,
        emotion_session: Mutex<Session>,
    }

    impl OnnxEmotionClassifier {
        pub fn new(
            face_model: impl AsRef<Path>,
            emotion_model: impl AsRef<Path>,
        ) -> Result<Self, ModalityError> {
            Ok(Self {
                face_session: Mutex::new(load_session(face_model.as_ref())?),
                emotion_session: Mutex::new(load_session(emotion_model.as_ref())?),
            })
        }

        /// 检测图中置信度最高的人脸，返回像素坐标 (x, y, w, h)
        fn detect_face(
            &self,
            image: &DynamicImage,
        ) -> Result<Option<(u32, u32, u32, u32)>, ModalityError> {
            let resized = image
                .resize_exact(FACE_INPUT_WIDTH, FACE_INPUT_HEIGHT, FilterType::Triangle)
                .to_rgb8();

            // 输入 [1, 3, 240, 320]，像素归一化 (x - 127) / 128
            let mut input = ndarray::Array4::<f32>::zeros((
                1,
                3,
                FACE_INPUT_HEIGHT as usize,
                FACE_INPUT_WIDTH as usize,
            ));
            for (x, y, pixel) in resized.enumerate_pixels() {
                for c in 0..3 {
                    input[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - 127.0) / 128.0;
                }
            }

            let input_tensor = Tensor::from_array(input)
                .map_err(|e| ModalityError::Execution(format!("构建输入张量失败: {}", e)))?;

            let mut session = self
                .face_session
                .lock()
                .map_err(|_| ModalityError::Execution("人脸模型锁中毒".to_string()))?;
            let outputs = session
                .run(ort::inputs!["input" => input_tensor])
                .map_err(|e| ModalityError::Execution(format!("人脸检测推理失败: {}", e)))?;

            // 输出 scores [1, N, 2]，boxes [1, N, 4]（相对坐标 x1,y1,x2,y2）
            let (_, scores) = outputs
                .get("scores")
                .ok_or_else(|| ModalityError::Execution("缺少 scores 输出".to_string()))?
                .try_extract_tensor::<f32>()
                .map_err(|e| ModalityError::Execution(e.to_string()))?;
            let (_, boxes) = outputs
                .get("boxes")
                .ok_or_else(|| ModalityError::Execution("缺少 boxes 输出".to_string()))?
                .try_extract_tensor::<f32>()
                .map_err(|e| ModalityError::Execution(e.to_string()))?;

            let num_boxes = scores.len() / 2;
            let mut best: Option<(f32, usize)> = None;
            for i in 0..num_boxes {
                let confidence = scores[i * 2 + 1];
                if confidence >= FACE_SCORE_THRESHOLD
                    && best.map(|(c, _)| confidence > c).unwrap_or(true)
                {
                    best = Some((confidence, i));
                }
            }

            let Some((_, idx)) = best else {
                return Ok(None);
            };

            let (img_w, img_h) = (image.width() as f32, image.height() as f32);
            let x1 = (boxes[idx * 4] * img_w).clamp(0.0, img_w - 1.0);
            let y1 = (boxes[idx * 4 + 1] * img_h).clamp(0.0, img_h - 1.0);
            let x2 = (boxes[idx * 4 + 2] * img_w).clamp(0.0, img_w);
            let y2 = (boxes[idx * 4 + 3] * img_h).clamp(0.0, img_h);
            if x2 <= x1 || y2 <= y1 {
                return Ok(None);
            }

            Ok(Some((
                x1 as u32,
                y1 as u32,
                (x2 - x1) as u32,
                (y2 - y1) as u32,
            )))
        }

        /// 对裁剪出的人脸做 FER+ 分类
        fn classify_face(&self, face: &DynamicImage) -> Result<EmotionSample, ModalityError> {
            let gray = face
                .resize_exact(EMOTION_INPUT_SIZE, EMOTION_INPUT_SIZE, FilterType::Triangle)
                .to_luma8();

            // FER+ 输入 [1, 1, 64, 64]，原始灰度值不归一化
            let mut input = ndarray::Array4::<f32>::zeros((
                1,
                1,
                EMOTION_INPUT_SIZE as usize,
                EMOTION_INPUT_SIZE as usize,
            ));
            for (x, y, pixel) in gray.enumerate_pixels() {
                input[[0, 0, y as usize, x as usize]] = pixel[0] as f32;
            }

            let input_tensor = Tensor::from_array(input)
                .map_err(|e| ModalityError::Execution(format!("构建输入张量失败: {}", e)))?;

            let mut session = self
                .emotion_session
                .lock()
                .map_err(|_| ModalityError::Execution("表情模型锁中毒".to_string()))?;
            let outputs = session
                .run(ort::inputs!["Input3" => input_tensor])
                .map_err(|e| ModalityError::Execution(format!("表情分类推理失败: {}", e)))?;

            let (_, logits) = outputs
                .get("Plus692_Output_0")
                .ok_or_else(|| ModalityError::Execution("缺少表情输出张量".to_string()))?
                .try_extract_tensor::<f32>()
                .map_err(|e| ModalityError::Execution(e.to_string()))?;

            if logits.len() < FERPLUS_LABELS.len() {
                return Err(ModalityError::Execution(format!(
                    "表情输出维度不符: {}",
                    logits.len()
                )));
            }

            // softmax 转为 0-100 的强度
            let max_logit = logits
                .iter()
                .take(FERPLUS_LABELS.len())
                .fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let exps: Vec<f32> = logits
                .iter()
                .take(FERPLUS_LABELS.len())
                .map(|&l| (l - max_logit).exp())
                .collect();
            let sum: f32 = exps.iter().sum();

            let mut scores = HashMap::new();
            let mut dominant = FERPLUS_LABELS[0];
            let mut best = f32::NEG_INFINITY;
            for (label, exp) in FERPLUS_LABELS.iter().zip(&exps) {
                let intensity = (exp / sum * 100.0) as f64;
                // contempt 不在固定标签集合内，只参与主导判断前的归一化
                if EMOTION_LABELS.contains(label) {
                    scores.insert((*label).to_string(), intensity);
                    if *exp > best {
                        best = *exp;
                        dominant = label;
                    }
                }
            }

            Ok(EmotionSample {
                scores,
                dominant: dominant.to_string(),
            })
        }
    }

    impl EmotionClassifier for OnnxEmotionClassifier {
        fn classify(&self, image: &DynamicImage) -> Result<Option<EmotionSample>, ModalityError> {
            let Some((x, y, w, h)) = self.detect_face(image)? else {
                return Ok(None);
            };
            let face = image.crop_imm(x, y, w, h);
            Ok(Some(self.classify_face(&face)?))
        }
    }

    fn load_session(path: &Path) -> Result<Session, ModalityError> {
        if !path.exists() {
            return Err(ModalityError::Unavailable(format!(
                "模型文件不存在: {}",
                path.display()
            )));
        }
        Session::builder()
            .map_err(|e| ModalityError::Unavailable(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| ModalityError::Unavailable(e.to_string()))?
            .with_intra_threads(1)
            .map_err(|e| ModalityError::Unavailable(e.to_string()))?
            .commit_from_file(path)
            .map_err(|e| ModalityError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dominant: &str, pairs: &[(&str, f64)]) -> EmotionSample {
        EmotionSample {
            scores: pairs
                .iter()
                .map(|(l, v)| (l.to_string(), *v))
                .collect(),
            dominant: dominant.to_string(),
        }
    }

    #[test]
    fn test_no_samples_is_no_detections() {
        assert!(matches!(aggregate_samples(&[]), EmotionOutcome::NoDetections));
    }

    #[test]
    fn test_average_and_score() {
        let samples = vec![
            sample("happy", &[("happy", 80.0), ("neutral", 20.0)]),
            sample("happy", &[("happy", 40.0), ("neutral", 60.0)]),
        ];
        let EmotionOutcome::Detected(result) = aggregate_samples(&samples) else {
            panic!("应当有检测结果");
        };
        // happy 平均 60，neutral 平均 40
        let get = |label: &str| {
            result
                .avg_scores
                .iter()
                .find(|(l, _)| l == label)
                .map(|(_, v)| *v)
                .unwrap()
        };
        assert!((get("happy") - 60.0).abs() < 1e-9);
        assert!((get("neutral") - 40.0).abs() < 1e-9);
        // 正向 = 60 + 0.7*40 = 88，负向 = 0，得分 = round(0.6*88) = 53
        assert_eq!(result.score, 53);
        assert_eq!(result.dominant, "happy");
    }

    #[test]
    fn test_score_clamped_to_zero() {
        let samples = vec![sample("sad", &[("sad", 90.0), ("angry", 90.0), ("fear", 90.0)])];
        let EmotionOutcome::Detected(result) = aggregate_samples(&samples) else {
            panic!("应当有检测结果");
        };
        assert_eq!(result.score, 0);
    }

    #[test]
    fn test_score_clamped_to_hundred() {
        // 强度超出常规范围时得分也不会越界
        let samples = vec![sample("happy", &[("happy", 500.0)])];
        let EmotionOutcome::Detected(result) = aggregate_samples(&samples) else {
            panic!("应当有检测结果");
        };
        assert_eq!(result.score, 100);
    }

    #[test]
    fn test_dominant_tie_broken_by_first_occurrence() {
        // neutral 与 happy 各出现两次，取样本中先出现的 neutral
        let samples = vec![
            sample("neutral", &[("neutral", 50.0)]),
            sample("happy", &[("happy", 50.0)]),
            sample("happy", &[("happy", 50.0)]),
            sample("neutral", &[("neutral", 50.0)]),
        ];
        let EmotionOutcome::Detected(result) = aggregate_samples(&samples) else {
            panic!("应当有检测结果");
        };
        assert_eq!(result.dominant, "neutral");
    }

    /// 固定返回同一结果的分类器，偶数帧报告无人脸
    struct StubClassifier;

    impl EmotionClassifier for StubClassifier {
        fn classify(&self, image: &DynamicImage) -> Result<Option<EmotionSample>, ModalityError> {
            if image.width() % 2 == 0 {
                return Ok(None);
            }
            Ok(Some(sample("happy", &[("happy", 80.0), ("neutral", 20.0)])))
        }
    }

    #[test]
    fn test_analyze_frames_skips_undetected_and_non_images() {
        let dir = std::env::temp_dir()
            .join("presentation-analysis-test")
            .join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir).unwrap();

        // 宽度为奇数的帧有人脸，偶数的没有；非图片文件直接忽略
        image::RgbImage::new(3, 3)
            .save(dir.join("frame_0.jpg"))
            .unwrap();
        image::RgbImage::new(4, 4)
            .save(dir.join("frame_1.jpg"))
            .unwrap();
        image::RgbImage::new(5, 5)
            .save(dir.join("frame_2.jpg"))
            .unwrap();
        std::fs::write(dir.join("notes.txt"), b"ignore me").unwrap();

        let outcome = analyze_frames(&StubClassifier, &dir).unwrap();
        let EmotionOutcome::Detected(result) = outcome else {
            panic!("应当有检测结果");
        };
        assert_eq!(result.dominant, "happy");
        // 两个有人脸的帧平均：happy 80，neutral 20
        // 正向 = 80 + 0.7*20 = 94，得分 = round(0.6*94) = 56
        assert_eq!(result.score, 56);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_analyze_frames_missing_dir_is_error() {
        let missing = std::env::temp_dir().join(format!("not-there-{}", uuid::Uuid::new_v4()));
        assert!(matches!(
            analyze_frames(&StubClassifier, &missing),
            Err(ModalityError::Execution(_))
        ));
    }

    #[test]
    fn test_dominant_majority_wins() {
        let samples = vec![
            sample("sad", &[("sad", 50.0)]),
            sample("happy", &[("happy", 50.0)]),
            sample("happy", &[("happy", 50.0)]),
        ];
        let EmotionOutcome::Detected(result) = aggregate_samples(&samples) else {
            panic!("应当有检测结果");
        };
        assert_eq!(result.dominant, "happy");
    }
}
