use ffmpeg_next as ffmpeg;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::ModalityError;
use crate::workspace::cleanup_directory;

/// 帧率未知时的默认采样间隔（帧）
pub const DEFAULT_FRAME_INTERVAL: usize = 30;

/// 根据帧率计算采样间隔
///
/// 帧率未知或为零时使用默认间隔，否则取 round(帧率)，最小为 1，
/// 即大约每秒分析一帧。
pub fn interval_for_rate(frame_rate: f64) -> usize {
    if frame_rate.is_finite() && frame_rate > 0.0 {
        (frame_rate.round() as usize).max(1)
    } else {
        DEFAULT_FRAME_INTERVAL
    }
}

/// 一次采样的结果
#[derive(Debug, Clone)]
pub struct SampledFrames {
    /// 采样帧所在目录
    pub output_dir: PathBuf,
    /// 视频声明的帧率
    pub frame_rate: f64,
    /// 实际写出的帧数
    pub frame_count: usize,
}

/// 帧采样器，按固定间隔顺序解码视频帧
pub struct FrameSampler {
    input_path: PathBuf,
}

impl FrameSampler {
    pub fn new(input_path: impl AsRef<Path>) -> Result<Self, ModalityError> {
        ffmpeg::init().map_err(|e| ModalityError::Execution(format!("初始化 FFmpeg 失败: {}", e)))?;

        // 设置 FFmpeg 日志级别为 ERROR，抑制警告和信息消息
        unsafe {
            ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
        }

        Ok(Self {
            input_path: input_path.as_ref().to_path_buf(),
        })
    }

    /// 视频声明的帧率（未知时返回 0）
    pub fn frame_rate(&self) -> Result<f64, ModalityError> {
        let ictx = self.open()?;
        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| ModalityError::OpenFailed("未找到视频流".to_string()))?;
        Ok(rate_to_f64(stream.avg_frame_rate()))
    }

    /// 容器时长（秒），未知时返回 0
    pub fn duration_seconds(&self) -> Result<f64, ModalityError> {
        let ictx = self.open()?;
        let duration = ictx.duration();
        if duration > 0 {
            Ok(duration as f64 / ffmpeg::ffi::AV_TIME_BASE as f64)
        } else {
            Ok(0.0)
        }
    }

    /// 视频是否包含音频轨
    pub fn has_audio_stream(&self) -> Result<bool, ModalityError> {
        let ictx = self.open()?;
        Ok(ictx.streams().best(ffmpeg::media::Type::Audio).is_some())
    }

    /// 按间隔采样并把每帧存为 output_dir 下的 frame_{n}.jpg
    ///
    /// 输出文件从 0 开始按写出顺序编号。输出目录会先清空重建。
    pub fn sample_to_dir(&self, output_dir: &Path) -> Result<SampledFrames, ModalityError> {
        cleanup_directory(output_dir);
        std::fs::create_dir_all(output_dir)
            .map_err(|e| ModalityError::Execution(format!("创建帧输出目录失败: {}", e)))?;

        let frame_rate = self.for_each_sampled(|index, img| {
            let frame_path = output_dir.join(format!("frame_{}.jpg", index));
            img.save(&frame_path).map_err(|e| {
                ModalityError::Execution(format!("保存帧失败 {}: {}", frame_path.display(), e))
            })
        })?;

        let frame_count = std::fs::read_dir(output_dir)
            .map_err(|e| ModalityError::Execution(format!("读取帧输出目录失败: {}", e)))?
            .count();
        info!(
            "已提取 {} 帧到 {}（帧率 {:.2}）",
            frame_count,
            output_dir.display(),
            frame_rate
        );

        Ok(SampledFrames {
            output_dir: output_dir.to_path_buf(),
            frame_rate,
            frame_count,
        })
    }

    /// 顺序解码视频，对每个命中采样间隔的帧调用回调
    ///
    /// 回调参数为采样帧的序号（从 0 开始）和解码出的 RGB 图像。
    /// 返回视频声明的帧率。视频无法打开时返回 OpenFailed。
    pub fn for_each_sampled(
        &self,
        mut on_sampled: impl FnMut(usize, &DynamicImage) -> Result<(), ModalityError>,
    ) -> Result<f64, ModalityError> {
        let mut ictx = self.open()?;

        // 先取出流信息，避免借用冲突
        let (stream_index, frame_rate, parameters) = {
            let stream = ictx
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| ModalityError::OpenFailed("未找到视频流".to_string()))?;
            (
                stream.index(),
                rate_to_f64(stream.avg_frame_rate()),
                stream.parameters(),
            )
        };

        let interval = interval_for_rate(frame_rate);
        debug!("采样间隔: 每 {} 帧取 1 帧（帧率 {:.2}）", interval, frame_rate);

        let decoder_context = ffmpeg::codec::context::Context::from_parameters(parameters)
            .map_err(|e| ModalityError::OpenFailed(format!("无法创建解码器上下文: {}", e)))?;
        let mut decoder = decoder_context
            .decoder()
            .video()
            .map_err(|e| ModalityError::OpenFailed(format!("无法创建视频解码器: {}", e)))?;

        let mut scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| ModalityError::Execution(format!("无法创建缩放器: {}", e)))?;

        let mut frame_index = 0usize;
        let mut sampled_count = 0usize;
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        let mut drain = |decoder: &mut ffmpeg::decoder::Video,
                         on_sampled: &mut dyn FnMut(usize, &DynamicImage) -> Result<(), ModalityError>|
         -> Result<(), ModalityError> {
            while decoder.receive_frame(&mut decoded).is_ok() {
                if frame_index % interval == 0 {
                    scaler
                        .run(&decoded, &mut rgb_frame)
                        .map_err(|e| ModalityError::Execution(format!("帧格式转换失败: {}", e)))?;
                    let img = frame_to_image(&rgb_frame)?;
                    on_sampled(sampled_count, &img)?;
                    sampled_count += 1;
                }
                frame_index += 1;
            }
            Ok(())
        };

        for (stream, packet) in ictx.packets() {
            if stream.index() != stream_index {
                continue;
            }
            // 损坏的数据包跳过，不中断整个采样
            if decoder.send_packet(&packet).is_err() {
                continue;
            }
            drain(&mut decoder, &mut on_sampled)?;
        }

        // 冲刷解码器中剩余的帧
        let _ = decoder.send_eof();
        drain(&mut decoder, &mut on_sampled)?;

        Ok(frame_rate)
    }

    fn open(&self) -> Result<ffmpeg::format::context::Input, ModalityError> {
        ffmpeg::format::input(&self.input_path)
            .map_err(|e| ModalityError::OpenFailed(format!("{}: {}", self.input_path.display(), e)))
    }
}

fn rate_to_f64(rate: ffmpeg::Rational) -> f64 {
    if rate.denominator() > 0 {
        rate.numerator() as f64 / rate.denominator() as f64
    } else {
        0.0
    }
}

/// 将 RGB24 格式的 FFmpeg 帧转换为 DynamicImage
fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<DynamicImage, ModalityError> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let data = frame.data(0);

    // 按行拷贝，去掉 stride 对齐带来的填充字节
    let mut buffer = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let start = y * stride;
        buffer.extend_from_slice(&data[start..start + width * 3]);
    }

    let img = image::RgbImage::from_raw(width as u32, height as u32, buffer)
        .ok_or_else(|| ModalityError::Execution("帧缓冲区大小不符".to_string()))?;
    Ok(DynamicImage::ImageRgb8(img))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::process::{Command, Stdio};

    /// 用 ffmpeg 命令行把纯色帧序列编码成测试视频
    ///
    /// 找不到 ffmpeg 命令时返回 false，调用方跳过该测试。
    fn encode_test_video(path: &Path, frames: usize, rate: u32) -> bool {
        const WIDTH: usize = 64;
        const HEIGHT: usize = 48;

        let mut child = match Command::new("ffmpeg")
            .arg("-loglevel")
            .arg("error")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-s")
            .arg(format!("{}x{}", WIDTH, HEIGHT))
            .arg("-r")
            .arg(rate.to_string())
            .arg("-i")
            .arg("-")
            .arg("-c:v")
            .arg("mpeg4")
            .arg("-q:v")
            .arg("5")
            .arg("-y")
            .arg(path)
            .stdin(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(_) => return false,
        };

        if let Some(stdin) = child.stdin.as_mut() {
            for i in 0..frames {
                let frame = vec![(i % 251) as u8; WIDTH * HEIGHT * 3];
                if stdin.write_all(&frame).is_err() {
                    return false;
                }
            }
        }
        drop(child.stdin.take());
        child.wait().map(|s| s.success()).unwrap_or(false)
    }

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir()
            .join("presentation-analysis-test")
            .join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_sample_to_dir_one_frame_per_second() {
        let dir = temp_dir();
        let video = dir.join("fixture.mp4");
        // 30 fps 共 300 帧，间隔 30，应采出第 0,30,...,270 帧共 10 张
        if !encode_test_video(&video, 300, 30) {
            eprintln!("未找到可用的 ffmpeg 命令，跳过");
            return;
        }

        let sampler = FrameSampler::new(&video).unwrap();
        let frames_dir = dir.join("frames");
        let sampled = sampler.sample_to_dir(&frames_dir).unwrap();

        assert!((sampled.frame_rate - 30.0).abs() < 0.5);
        assert_eq!(sampled.frame_count, 10);
        // 输出文件从 0 开始连续编号
        for i in 0..sampled.frame_count {
            assert!(frames_dir.join(format!("frame_{}.jpg", i)).exists());
        }
        assert!(!frames_dir.join("frame_10.jpg").exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_for_each_sampled_sequential_indices() {
        let dir = temp_dir();
        let video = dir.join("fixture.mp4");
        // 30 fps 共 90 帧，应命中第 0、30、60 帧
        if !encode_test_video(&video, 90, 30) {
            eprintln!("未找到可用的 ffmpeg 命令，跳过");
            return;
        }

        let sampler = FrameSampler::new(&video).unwrap();
        let mut indices = Vec::new();
        let frame_rate = sampler
            .for_each_sampled(|index, img| {
                assert_eq!((img.width(), img.height()), (64, 48));
                indices.push(index);
                Ok(())
            })
            .unwrap();

        assert!((frame_rate - 30.0).abs() < 0.5);
        assert_eq!(indices, vec![0, 1, 2]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_interval_for_known_rate() {
        // 30 fps 的视频每 30 帧取 1 帧
        assert_eq!(interval_for_rate(30.0), 30);
        // NTSC 帧率四舍五入
        assert_eq!(interval_for_rate(29.97), 30);
        assert_eq!(interval_for_rate(23.976), 24);
    }

    #[test]
    fn test_interval_for_unknown_rate() {
        assert_eq!(interval_for_rate(0.0), DEFAULT_FRAME_INTERVAL);
        assert_eq!(interval_for_rate(-1.0), DEFAULT_FRAME_INTERVAL);
        assert_eq!(interval_for_rate(f64::NAN), DEFAULT_FRAME_INTERVAL);
    }

    #[test]
    fn test_interval_never_below_one() {
        assert_eq!(interval_for_rate(0.4), 1);
        assert_eq!(interval_for_rate(1.0), 1);
    }

    #[test]
    fn test_open_missing_file_is_open_failed() {
        let sampler = FrameSampler::new("/definitely/not/a/video.mp4").unwrap();
        match sampler.frame_rate() {
            Err(ModalityError::OpenFailed(_)) => {}
            other => panic!("预期 OpenFailed，实际: {:?}", other),
        }
    }
}
