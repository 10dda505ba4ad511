use serde::ser::Serializer;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::emotion::EmotionOutcome;
use crate::error::ModalityError;
use crate::openpose::PoseConsistencyResult;
use crate::posture::PostureOutcome;
use crate::speech::SpeechAnalysis;

/// 转写预览的最大长度
const TRANSCRIPT_PREVIEW_LEN: usize = 300;

/// 单个维度的得分状态
///
/// 序列化为数字、"N/A" 或 "Error"，与响应 JSON 的约定一致。
#[derive(Debug, Clone, PartialEq)]
pub enum ModalityScore {
    Value(i64),
    NotAvailable,
    Error,
}

impl ModalityScore {
    pub fn numeric(&self) -> Option<i64> {
        match self {
            ModalityScore::Value(v) => Some(*v),
            _ => None,
        }
    }
}

impl Serialize for ModalityScore {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ModalityScore::Value(v) => serializer.serialize_i64(*v),
            ModalityScore::NotAvailable => serializer.serialize_str("N/A"),
            ModalityScore::Error => serializer.serialize_str("Error"),
        }
    }
}

/// 最终的分析报告
#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    /// 0-100 综合得分（没有任何数字得分时为 0）
    pub overall_score: i64,
    /// 各维度的得分或状态
    pub scores: BTreeMap<String, ModalityScore>,
    /// 数值型指标
    pub metrics: BTreeMap<String, serde_json::Value>,
    /// 明细（主导表情、转写预览等）
    pub details: BTreeMap<String, serde_json::Value>,
    /// 累积的错误信息
    pub errors: Vec<String>,
    /// 人类可读的总结
    pub feedback_summary: String,
}

/// 报告构建器
///
/// 各维度的结果和错误增量地记录进来；构建器本身不会失败，
/// 只负责记录，最后一次性产出报告。
#[derive(Debug, Default)]
pub struct ReportBuilder {
    scores: BTreeMap<String, ModalityScore>,
    metrics: BTreeMap<String, serde_json::Value>,
    details: BTreeMap<String, serde_json::Value>,
    errors: Vec<String>,
    // 总结用的中间量
    dominant_emotion: Option<String>,
    pace_wpm: Option<i64>,
    clarity_score: Option<i64>,
    filler_count: Option<usize>,
    avg_visibility: Option<f64>,
}

impl ReportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录表情分析结果
    pub fn record_emotion(&mut self, outcome: &EmotionOutcome) {
        match outcome {
            EmotionOutcome::Detected(result) => {
                self.scores
                    .insert("facial_emotion".to_string(), ModalityScore::Value(result.score));
                self.details.insert(
                    "dominant_emotion".to_string(),
                    serde_json::Value::String(result.dominant.clone()),
                );
                let avg: serde_json::Map<String, serde_json::Value> = result
                    .avg_scores
                    .iter()
                    .map(|(label, value)| (label.clone(), serde_json::json!(value)))
                    .collect();
                self.details
                    .insert("emotion_avg_scores".to_string(), serde_json::Value::Object(avg));
                self.dominant_emotion = Some(result.dominant.clone());
            }
            // 跑完但没有检测到人脸：得分按 0 记，与"未尝试"区分开
            EmotionOutcome::NoDetections => {
                self.scores
                    .insert("facial_emotion".to_string(), ModalityScore::Value(0));
                self.details.insert(
                    "dominant_emotion".to_string(),
                    serde_json::Value::String("N/A".to_string()),
                );
            }
        }
    }

    /// 记录表情分析错误
    pub fn record_emotion_error(&mut self, error: &ModalityError) {
        let status = if error.is_unavailable() {
            ModalityScore::NotAvailable
        } else {
            ModalityScore::Error
        };
        self.scores.insert("facial_emotion".to_string(), status);
        self.errors.push(format!("表情分析错误: {}", error));
    }

    /// 记录姿态可见性分析结果
    pub fn record_posture(&mut self, outcome: &PostureOutcome) {
        match outcome {
            PostureOutcome::Detected(result) => {
                self.scores
                    .insert("body_posture".to_string(), ModalityScore::Value(result.score));
                self.metrics.insert(
                    "posture_avg_visibility".to_string(),
                    serde_json::json!((result.average_visibility * 100.0).round() / 100.0),
                );
                self.avg_visibility = Some(result.average_visibility);
            }
            PostureOutcome::NoDetections => {
                self.scores
                    .insert("body_posture".to_string(), ModalityScore::Value(0));
                self.metrics
                    .insert("posture_avg_visibility".to_string(), serde_json::json!(0.0));
            }
        }
    }

    /// 记录姿态分析错误
    pub fn record_posture_error(&mut self, error: &ModalityError) {
        let status = if error.is_unavailable() {
            ModalityScore::NotAvailable
        } else {
            ModalityScore::Error
        };
        self.scores.insert("body_posture".to_string(), status);
        self.errors.push(format!("姿态分析错误: {}", error));
    }

    /// 记录语音分析结果
    pub fn record_speech(&mut self, analysis: &SpeechAnalysis) {
        self.scores.insert(
            "speech_clarity".to_string(),
            ModalityScore::Value(analysis.clarity_score),
        );
        self.metrics.insert(
            "speech_pace_wpm".to_string(),
            serde_json::json!(analysis.pace_wpm),
        );
        self.metrics.insert(
            "word_count".to_string(),
            serde_json::json!(analysis.word_count),
        );
        self.metrics.insert(
            "filler_count".to_string(),
            serde_json::json!(analysis.filler_count),
        );

        let preview = if analysis.transcript.chars().count() > TRANSCRIPT_PREVIEW_LEN {
            let truncated: String = analysis
                .transcript
                .chars()
                .take(TRANSCRIPT_PREVIEW_LEN)
                .collect();
            format!("{}...", truncated)
        } else {
            analysis.transcript.clone()
        };
        self.details.insert(
            "transcript_preview".to_string(),
            serde_json::Value::String(preview),
        );

        self.pace_wpm = Some(analysis.pace_wpm);
        self.clarity_score = Some(analysis.clarity_score);
        self.filler_count = Some(analysis.filler_count);
    }

    /// 记录语音分析错误
    pub fn record_speech_error(&mut self, error: &ModalityError) {
        self.scores
            .insert("speech_clarity".to_string(), ModalityScore::Error);
        self.metrics.insert(
            "speech_pace_wpm".to_string(),
            serde_json::Value::String("Error".to_string()),
        );
        self.details.insert(
            "transcript_preview".to_string(),
            serde_json::Value::String("Error".to_string()),
        );
        self.errors.push(format!("语音分析错误: {}", error));
    }

    /// 记录 OpenPose 检测一致性结果
    pub fn record_openpose(&mut self, result: &PoseConsistencyResult) {
        self.scores.insert(
            "body_pose_openpose".to_string(),
            ModalityScore::Value(result.score),
        );
        self.metrics.insert(
            "openpose_frames_analyzed".to_string(),
            serde_json::json!(result.frames_analyzed),
        );
        self.metrics.insert(
            "openpose_frames_with_people".to_string(),
            serde_json::json!(result.frames_with_people),
        );
    }

    /// 记录 OpenPose 分析错误
    pub fn record_openpose_error(&mut self, error: &ModalityError) {
        let status = if error.is_unavailable() {
            ModalityScore::NotAvailable
        } else {
            ModalityScore::Error
        };
        self.scores.insert("body_pose_openpose".to_string(), status);
        self.errors.push(format!("OpenPose 分析错误: {}", error));
    }

    /// 产出最终报告
    ///
    /// 综合得分是所有数字得分的平均值（四舍五入并钳到 0-100）；
    /// "N/A"/"Error" 的维度不参与平均。没有任何数字得分时记 0。
    pub fn finalize(self) -> AnalysisReport {
        let numeric: Vec<i64> = self.scores.values().filter_map(|s| s.numeric()).collect();
        let overall_score = if numeric.is_empty() {
            0
        } else {
            let mean = numeric.iter().sum::<i64>() as f64 / numeric.len() as f64;
            (mean.round() as i64).clamp(0, 100)
        };

        let feedback_summary = self.build_summary(overall_score);

        AnalysisReport {
            overall_score,
            scores: self.scores,
            metrics: self.metrics,
            details: self.details,
            errors: self.errors,
            feedback_summary,
        }
    }

    /// 只为成功的维度拼接总结语句
    fn build_summary(&self, overall_score: i64) -> String {
        let mut parts = vec![format!("Overall Score: {}/100.", overall_score)];

        let emotion_ok = self
            .scores
            .get("facial_emotion")
            .and_then(|s| s.numeric())
            .is_some();
        if emotion_ok {
            let dominant = self.dominant_emotion.as_deref().unwrap_or("neutral");
            parts.push(format!("Appeared predominantly {}.", dominant));
        }

        if let Some(wpm) = self.pace_wpm {
            let pace_desc = if wpm > 170 {
                "very fast"
            } else if wpm > 140 {
                "fast"
            } else if wpm > 110 {
                "moderate"
            } else {
                "slow"
            };
            parts.push(format!("Speech pace was {} ({} WPM).", pace_desc, wpm));
        }

        if let Some(clarity) = self.clarity_score {
            let clarity_desc = if clarity > 90 {
                "very clear"
            } else if clarity > 75 {
                "clear"
            } else if clarity > 50 {
                "moderately clear"
            } else {
                "less clear"
            };
            parts.push(format!(
                "Speech was {} (Clarity Score: {}/100, Fillers: {}).",
                clarity_desc,
                clarity,
                self.filler_count.unwrap_or(0)
            ));
        }

        if let Some(visibility) = self.avg_visibility {
            let posture_desc = if visibility > 0.7 {
                "clearly visible"
            } else if visibility > 0.4 {
                "moderately visible"
            } else {
                "partially obscured"
            };
            parts.push(format!("Posture was generally {}.", posture_desc));
        }

        parts.join(" ")
    }
}
