use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::AnalysisConfig;
use crate::emotion::{self, EmotionClassifier};
use crate::error::ModalityError;
use crate::frame_sampler::FrameSampler;
use crate::openpose;
use crate::posture::{self, LandmarkDetector};
use crate::report::{AnalysisReport, ReportBuilder};
use crate::speech::{self, HttpTranscriber, HttpTranscriberConfig, Transcriber};
use crate::workspace::{cleanup_directory, RequestWorkspace};

/// 分析流水线依赖的全部能力
///
/// 进程启动时构建一次，所有请求共享。模型加载失败时对应的
/// 能力为 None，相关维度会在报告中记为 "N/A" 而不是让服务
/// 无法启动。
pub struct AnalysisServices {
    pub config: AnalysisConfig,
    pub emotion: Option<Arc<dyn EmotionClassifier>>,
    pub landmarks: Option<Arc<dyn LandmarkDetector>>,
    pub transcriber: Arc<dyn Transcriber>,
}

impl AnalysisServices {
    /// 按配置构建各个分析能力
    pub fn from_config(config: AnalysisConfig) -> Result<Self> {
        let emotion = Self::build_emotion_classifier(&config);
        let landmarks = Self::build_landmark_detector(&config);

        let transcriber: Arc<dyn Transcriber> =
            Arc::new(HttpTranscriber::new(HttpTranscriberConfig {
                url: config.transcriber_url.clone(),
                timeout_secs: config.modality_timeout_secs,
            })
            .map_err(|e| anyhow::anyhow!("初始化转写客户端失败: {}", e))?);

        Ok(Self {
            config,
            emotion,
            landmarks,
            transcriber,
        })
    }

    #[cfg(feature = "onnx")]
    fn build_emotion_classifier(config: &AnalysisConfig) -> Option<Arc<dyn EmotionClassifier>> {
        let (Some(face_model), Some(emotion_model)) = (&config.face_model, &config.emotion_model)
        else {
            warn!("未配置人脸/表情模型路径，表情维度将记为 N/A");
            return None;
        };
        match emotion::OnnxEmotionClassifier::new(face_model, emotion_model) {
            Ok(classifier) => {
                info!("✅ 表情模型已加载");
                Some(Arc::new(classifier))
            }
            Err(e) => {
                warn!("表情模型加载失败，表情维度将记为 N/A: {}", e);
                None
            }
        }
    }

    #[cfg(not(feature = "onnx"))]
    fn build_emotion_classifier(_config: &AnalysisConfig) -> Option<Arc<dyn EmotionClassifier>> {
        warn!("编译时未启用 onnx 特性，表情维度将记为 N/A");
        None
    }

    #[cfg(feature = "onnx")]
    fn build_landmark_detector(config: &AnalysisConfig) -> Option<Arc<dyn LandmarkDetector>> {
        let Some(pose_model) = &config.pose_model else {
            warn!("未配置姿态模型路径，姿态维度将记为 N/A");
            return None;
        };
        match posture::OnnxLandmarkDetector::new(pose_model) {
            Ok(detector) => {
                info!("✅ 姿态模型已加载");
                Some(Arc::new(detector))
            }
            Err(e) => {
                warn!("姿态模型加载失败，姿态维度将记为 N/A: {}", e);
                None
            }
        }
    }

    #[cfg(not(feature = "onnx"))]
    fn build_landmark_detector(_config: &AnalysisConfig) -> Option<Arc<dyn LandmarkDetector>> {
        warn!("编译时未启用 onnx 特性，姿态维度将记为 N/A");
        None
    }
}

/// 对一个落盘视频跑完整的四维度分析
///
/// 四个维度依次执行、互不影响：任何维度失败只记入报告的
/// errors 列表。CPU 密集的解码和推理放到阻塞线程池执行。
pub async fn analyze_video(
    services: Arc<AnalysisServices>,
    video_path: &Path,
    workspace: &RequestWorkspace,
) -> AnalysisReport {
    let total_start = Instant::now();
    let mut builder = ReportBuilder::new();

    run_emotion_stage(&services, video_path, workspace, &mut builder).await;
    run_posture_stage(&services, video_path, &mut builder).await;
    run_speech_stage(&services, video_path, workspace, &mut builder).await;
    run_openpose_stage(&services, video_path, workspace, &mut builder).await;

    let report = builder.finalize();
    info!(
        "🎉 分析完成 [{}]: 综合得分 {}，耗时 {:.2} 秒",
        workspace.request_id(),
        report.overall_score,
        total_start.elapsed().as_secs_f64()
    );
    report
}

/// 阶段一：采样帧 + 表情分析
async fn run_emotion_stage(
    services: &Arc<AnalysisServices>,
    video_path: &Path,
    workspace: &RequestWorkspace,
    builder: &mut ReportBuilder,
) {
    let start = Instant::now();
    let Some(classifier) = services.emotion.clone() else {
        builder.record_emotion_error(&ModalityError::Unavailable(
            "表情模型未加载".to_string(),
        ));
        return;
    };

    let video = video_path.to_path_buf();
    let frames_dir = workspace.frames_dir();
    let result = run_blocking(move || {
        let sampler = FrameSampler::new(&video)?;
        sampler.sample_to_dir(&frames_dir)?;
        emotion::analyze_frames(classifier.as_ref(), &frames_dir)
    })
    .await;

    // 采样帧用完即删，不等请求结束
    cleanup_directory(&workspace.frames_dir());

    match result {
        Ok(outcome) => {
            builder.record_emotion(&outcome);
            info!("🎭 表情分析完成，耗时 {:.2} 秒", start.elapsed().as_secs_f64());
        }
        Err(e) => {
            warn!("表情分析失败: {}", e);
            builder.record_emotion_error(&e);
        }
    }
}

/// 阶段二：姿态可见性分析
async fn run_posture_stage(
    services: &Arc<AnalysisServices>,
    video_path: &Path,
    builder: &mut ReportBuilder,
) {
    let start = Instant::now();
    let Some(detector) = services.landmarks.clone() else {
        builder.record_posture_error(&ModalityError::Unavailable(
            "姿态模型未加载".to_string(),
        ));
        return;
    };

    let video = video_path.to_path_buf();
    let result = run_blocking(move || posture::analyze_video(detector.as_ref(), &video)).await;

    match result {
        Ok(outcome) => {
            builder.record_posture(&outcome);
            info!("🧍 姿态分析完成，耗时 {:.2} 秒", start.elapsed().as_secs_f64());
        }
        Err(e) => {
            warn!("姿态分析失败: {}", e);
            builder.record_posture_error(&e);
        }
    }
}

/// 阶段三：音频提取 + 转写 + 语速/清晰度
async fn run_speech_stage(
    services: &Arc<AnalysisServices>,
    video_path: &Path,
    workspace: &RequestWorkspace,
    builder: &mut ReportBuilder,
) {
    let start = Instant::now();
    let transcriber = services.transcriber.clone();
    let video = video_path.to_path_buf();
    let audio_path = workspace.audio_path();

    let result =
        run_blocking(move || speech::analyze_video(transcriber.as_ref(), &video, &audio_path))
            .await;

    match result {
        Ok(analysis) => {
            builder.record_speech(&analysis);
            info!("🎤 语音分析完成，耗时 {:.2} 秒", start.elapsed().as_secs_f64());
        }
        Err(e) => {
            warn!("语音分析失败: {}", e);
            builder.record_speech_error(&e);
        }
    }
}

/// 阶段四：外部 OpenPose 检测一致性
async fn run_openpose_stage(
    services: &Arc<AnalysisServices>,
    video_path: &Path,
    workspace: &RequestWorkspace,
    builder: &mut ReportBuilder,
) {
    let start = Instant::now();
    let result = openpose::analyze_video(
        services.config.openpose_bin.as_deref(),
        video_path,
        &workspace.openpose_dir(),
        services.config.modality_timeout_secs,
    )
    .await;

    match result {
        Ok(pose) => {
            builder.record_openpose(&pose);
            info!("🦴 OpenPose 分析完成，耗时 {:.2} 秒", start.elapsed().as_secs_f64());
        }
        Err(e) => {
            warn!("OpenPose 分析失败: {}", e);
            builder.record_openpose_error(&e);
        }
    }
}

/// 在阻塞线程池中执行一个维度的 CPU 密集部分
async fn run_blocking<T: Send + 'static>(
    work: impl FnOnce() -> Result<T, ModalityError> + Send + 'static,
) -> Result<T, ModalityError> {
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ModalityError::Execution(format!("分析任务异常退出: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ModalityScore;

    struct FixedTranscriber(&'static str);

    impl Transcriber for FixedTranscriber {
        fn transcribe(&self, _audio_path: &Path) -> Result<String, ModalityError> {
            Ok(self.0.to_string())
        }
    }

    fn services_without_models() -> Arc<AnalysisServices> {
        Arc::new(AnalysisServices {
            config: AnalysisConfig::default(),
            emotion: None,
            landmarks: None,
            transcriber: Arc::new(FixedTranscriber("hello world")),
        })
    }

    #[tokio::test]
    async fn test_missing_capabilities_still_produce_report() {
        // 模型全缺 + 视频打不开时每个维度各自失败，
        // 请求仍然返回完整报告而不是错误
        let services = services_without_models();
        let base = std::env::temp_dir().join("presentation-analysis-test");
        let workspace = RequestWorkspace::create(&base).unwrap();
        let video = workspace.video_path("missing.mp4");

        let report = analyze_video(services, &video, &workspace).await;

        assert_eq!(report.overall_score, 0);
        assert_eq!(
            report.scores.get("facial_emotion"),
            Some(&ModalityScore::NotAvailable)
        );
        assert_eq!(
            report.scores.get("body_posture"),
            Some(&ModalityScore::NotAvailable)
        );
        assert_eq!(
            report.scores.get("body_pose_openpose"),
            Some(&ModalityScore::NotAvailable)
        );
        // 语音维度打不开视频，记为 Error
        assert_eq!(
            report.scores.get("speech_clarity"),
            Some(&ModalityScore::Error)
        );
        assert_eq!(report.errors.len(), 4);
        assert!(report.feedback_summary.starts_with("Overall Score: 0/100."));
    }

    #[tokio::test]
    async fn test_workspace_cleaned_after_analysis() {
        let services = services_without_models();
        let base = std::env::temp_dir().join("presentation-analysis-test");
        let root = {
            let workspace = RequestWorkspace::create(&base).unwrap();
            let video = workspace.video_path("missing.mp4");
            let _ = analyze_video(services, &video, &workspace).await;
            workspace.root().to_path_buf()
        };
        assert!(!root.exists());
    }
}
