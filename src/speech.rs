use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ModalityError;
use crate::frame_sampler::FrameSampler;

/// 口头禅词表，命中的词表条目计入 filler_count
///
/// 词先转小写并去掉首尾标点再比对；同一条目在文本中出现
/// 多次只记一次。
pub const FILLER_WORDS: [&str; 9] = [
    "um", "uh", "like", "you know", "so", "well", "actually", "basically", "literally",
];

/// 语音分析结果
#[derive(Debug, Clone)]
pub struct SpeechAnalysis {
    /// 完整转写文本
    pub transcript: String,
    /// 词数（按空白切分）
    pub word_count: usize,
    /// 音频时长（秒）
    pub duration_seconds: f64,
    /// 语速（词/分钟），时长为 0 时记 0
    pub pace_wpm: i64,
    /// 口头禅数量
    pub filler_count: usize,
    /// 0-100 清晰度得分
    pub clarity_score: i64,
}

/// 语音转写能力
pub trait Transcriber: Send + Sync {
    fn transcribe(&self, audio_path: &Path) -> Result<String, ModalityError>;
}

/// 对视频做语音分析
///
/// 提取音频到临时文件，转写后无条件删除临时音频。
/// 视频没有音频轨时返回 NoAudioTrack（维度级错误，不影响其他维度）。
pub fn analyze_video(
    transcriber: &dyn Transcriber,
    video_path: &Path,
    audio_path: &Path,
) -> Result<SpeechAnalysis, ModalityError> {
    let sampler = FrameSampler::new(video_path)?;
    if !sampler.has_audio_stream()? {
        return Err(ModalityError::NoAudioTrack);
    }
    let duration_seconds = sampler.duration_seconds()?;

    extract_audio(video_path, audio_path)?;
    info!("已提取临时音频: {}", audio_path.display());

    let transcribed = transcriber.transcribe(audio_path);

    // 无论转写成功与否都删除临时音频
    if audio_path.exists() {
        if let Err(e) = std::fs::remove_file(audio_path) {
            warn!("删除临时音频失败 {}: {}", audio_path.display(), e);
        }
    }

    let transcript = transcribed?;
    Ok(score_transcript(&transcript, duration_seconds))
}

/// 用 ffmpeg 命令行把音频轨提取为 16kHz 单声道 WAV
fn extract_audio(video_path: &Path, audio_path: &Path) -> Result<(), ModalityError> {
    let status = Command::new("ffmpeg")
        .arg("-loglevel")
        .arg("error") // 只显示错误信息
        .arg("-i")
        .arg(video_path)
        .arg("-vn") // 不包含视频
        .arg("-acodec")
        .arg("pcm_s16le")
        .arg("-ar")
        .arg("16000")
        .arg("-ac")
        .arg("1")
        .arg("-y") // 覆盖输出文件
        .arg(audio_path)
        .status()
        .map_err(|e| ModalityError::Execution(format!("执行 ffmpeg 命令失败: {}", e)))?;

    if !status.success() {
        return Err(ModalityError::Execution("音频提取失败".to_string()));
    }
    Ok(())
}

/// 从转写文本和时长推导语速与清晰度
pub fn score_transcript(transcript: &str, duration_seconds: f64) -> SpeechAnalysis {
    let words: Vec<&str> = transcript.split_whitespace().collect();
    let word_count = words.len();

    let pace_wpm = if duration_seconds > 0.0 {
        (word_count as f64 / (duration_seconds / 60.0)).round() as i64
    } else {
        warn!("音频时长为 0，无法计算语速");
        0
    };

    // 口头禅按词表条目计数，重复出现的同一条目只记一次
    let cleaned: Vec<String> = words
        .iter()
        .map(|word| {
            let lower = word.to_lowercase();
            lower
                .trim_matches(|c| matches!(c, '.' | ',' | '?' | '!'))
                .to_string()
        })
        .collect();
    let filler_count = FILLER_WORDS
        .iter()
        .filter(|filler| cleaned.iter().any(|token| token == *filler))
        .count();

    // 清晰度：每 1% 的口头禅占比扣 2 分；没有词则无可扣
    let clarity_score = if word_count > 0 {
        let filler_ratio = filler_count as f64 / word_count as f64;
        ((100.0 - filler_ratio * 200.0).round() as i64).clamp(0, 100)
    } else {
        100
    };

    SpeechAnalysis {
        transcript: transcript.to_string(),
        word_count,
        duration_seconds,
        pace_wpm,
        filler_count,
        clarity_score,
    }
}

/// 转写服务返回的响应
#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    text: String,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP 转写后端配置
#[derive(Debug, Clone)]
pub struct HttpTranscriberConfig {
    /// 转写服务地址
    pub url: String,
    /// 请求超时（秒）
    pub timeout_secs: u64,
}

/// HTTP 转写后端
///
/// 把提取出的音频文件整体上传到外部 Whisper 兼容服务的
/// POST {url}/transcribe 接口，取回完整文本。
pub struct HttpTranscriber {
    config: HttpTranscriberConfig,
    client: reqwest::blocking::Client,
}

impl HttpTranscriber {
    pub fn new(config: HttpTranscriberConfig) -> Result<Self, ModalityError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ModalityError::Unavailable(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self { config, client })
    }
}

impl Transcriber for HttpTranscriber {
    fn transcribe(&self, audio_path: &Path) -> Result<String, ModalityError> {
        let form = reqwest::blocking::multipart::Form::new()
            .file("file", audio_path)
            .map_err(|e| ModalityError::Execution(format!("读取音频文件失败: {}", e)))?;

        let url = format!("{}/transcribe", self.config.url);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .map_err(|e| ModalityError::Execution(format!("转写请求失败: {}", e)))?;

        if !response.status().is_success() {
            return Err(ModalityError::Execution(format!(
                "转写服务返回错误状态: {}",
                response.status()
            )));
        }

        let result: TranscribeResponse = response
            .json()
            .map_err(|e| ModalityError::Execution(format!("解析转写响应失败: {}", e)))?;

        if let Some(error) = result.error {
            return Err(ModalityError::Execution(format!(
                "转写服务返回错误: {}",
                error
            )));
        }

        Ok(result.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filler_counting() {
        // 8 个词命中 um、so、basically 三个条目（um 出现两次只记一次）
        let analysis = score_transcript("um so basically this is um a test", 60.0);
        assert_eq!(analysis.word_count, 8);
        assert_eq!(analysis.filler_count, 3);
        // 口头禅占比 0.375，清晰度 = round(100 - 200*0.375) = 25
        assert_eq!(analysis.clarity_score, 25);
    }

    #[test]
    fn test_repeated_filler_entry_counted_once() {
        let analysis = score_transcript("um um um this is fine", 60.0);
        assert_eq!(analysis.word_count, 6);
        assert_eq!(analysis.filler_count, 1);
        // 占比 1/6，清晰度 = round(100 - 200/6) = 67
        assert_eq!(analysis.clarity_score, 67);
    }

    #[test]
    fn test_filler_matching_strips_punctuation() {
        let analysis = score_transcript("Well, I think so.", 10.0);
        // "Well," 和 "so." 去标点转小写后命中
        assert_eq!(analysis.filler_count, 2);
    }

    #[test]
    fn test_pace_from_duration() {
        // 30 秒 60 个词 = 120 WPM
        let words = vec!["word"; 60].join(" ");
        let analysis = score_transcript(&words, 30.0);
        assert_eq!(analysis.pace_wpm, 120);
    }

    #[test]
    fn test_zero_duration_pace_is_zero() {
        let analysis = score_transcript("some words here", 0.0);
        assert_eq!(analysis.pace_wpm, 0);
    }

    #[test]
    fn test_empty_transcript_clarity_is_hundred() {
        let analysis = score_transcript("", 10.0);
        assert_eq!(analysis.word_count, 0);
        assert_eq!(analysis.clarity_score, 100);
        assert_eq!(analysis.filler_count, 0);
    }

    #[test]
    fn test_clarity_clamped_to_zero() {
        // 每个词都是不同的口头禅条目时占比 1.0，清晰度被钳到 0
        let analysis = score_transcript("um uh like so well", 10.0);
        assert_eq!(analysis.filler_count, 5);
        assert_eq!(analysis.clarity_score, 0);
    }

    #[test]
    fn test_clarity_in_range() {
        let analysis = score_transcript("um this is a longer sentence without much filler", 20.0);
        assert!(analysis.clarity_score >= 0 && analysis.clarity_score <= 100);
    }
}
