use anyhow::Result;
use std::env;
use std::path::{Path, PathBuf};

/// 分析服务配置
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// 请求工作区的根目录（未设置则使用系统临时目录）
    pub workspace_root: Option<PathBuf>,
    /// 人脸检测模型路径（ONNX）
    pub face_model: Option<PathBuf>,
    /// 表情分类模型路径（ONNX）
    pub emotion_model: Option<PathBuf>,
    /// 人体关键点模型路径（ONNX）
    pub pose_model: Option<PathBuf>,
    /// OpenPose 可执行文件路径
    pub openpose_bin: Option<PathBuf>,
    /// 转写服务地址
    pub transcriber_url: String,
    /// 单个维度的超时时间（秒）
    pub modality_timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            face_model: None,
            emotion_model: None,
            pose_model: None,
            openpose_bin: None,
            transcriber_url: "http://127.0.0.1:8090".to_string(),
            modality_timeout_secs: 300,
        }
    }
}

impl AnalysisConfig {
    /// 工作区根目录，默认为系统临时目录下的 presentation-analysis
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("presentation-analysis"))
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(
        config_file: Option<&Path>,
        openpose_bin: Option<PathBuf>,
        transcriber_url: Option<String>,
        modality_timeout_secs: Option<u64>,
    ) -> Result<AnalysisConfig> {
        // 1. 先加载配置文件（如果存在）
        let file_config = if let Some(config_path) = config_file {
            Self::load_from_file(config_path).ok()
        } else {
            // 尝试从默认位置加载
            Self::load_from_default_locations().ok()
        };

        // 2. 加载环境变量
        let env_config = Self::load_from_env();

        // 3. 合并配置（优先级：命令行 > 环境变量 > 配置文件 > 默认值）
        let defaults = AnalysisConfig::default();
        let config = AnalysisConfig {
            workspace_root: env_config
                .workspace_root
                .or(file_config.as_ref().and_then(|c| c.workspace_root.clone())),
            face_model: env_config
                .face_model
                .or(file_config.as_ref().and_then(|c| c.face_model.clone())),
            emotion_model: env_config
                .emotion_model
                .or(file_config.as_ref().and_then(|c| c.emotion_model.clone())),
            pose_model: env_config
                .pose_model
                .or(file_config.as_ref().and_then(|c| c.pose_model.clone())),
            openpose_bin: openpose_bin
                .or(env_config.openpose_bin)
                .or(file_config.as_ref().and_then(|c| c.openpose_bin.clone())),
            transcriber_url: transcriber_url
                .or(env_config.transcriber_url)
                .or(file_config.as_ref().map(|c| c.transcriber_url.clone()))
                .unwrap_or(defaults.transcriber_url),
            modality_timeout_secs: modality_timeout_secs
                .or(env_config.modality_timeout_secs)
                .or(file_config.as_ref().map(|c| c.modality_timeout_secs))
                .unwrap_or(defaults.modality_timeout_secs),
        };

        Ok(config)
    }

    /// 从环境变量加载配置（返回 Option 值，表示是否从环境变量中读取到）
    fn load_from_env() -> PartialConfig {
        PartialConfig {
            workspace_root: env::var("PRESENTATION_ANALYSIS_WORKSPACE")
                .ok()
                .map(PathBuf::from),
            face_model: env::var("PRESENTATION_ANALYSIS_FACE_MODEL")
                .ok()
                .map(PathBuf::from),
            emotion_model: env::var("PRESENTATION_ANALYSIS_EMOTION_MODEL")
                .ok()
                .map(PathBuf::from),
            pose_model: env::var("PRESENTATION_ANALYSIS_POSE_MODEL")
                .ok()
                .map(PathBuf::from),
            openpose_bin: env::var("PRESENTATION_ANALYSIS_OPENPOSE_BIN")
                .ok()
                .map(PathBuf::from),
            transcriber_url: env::var("PRESENTATION_ANALYSIS_TRANSCRIBER_URL").ok(),
            modality_timeout_secs: env::var("PRESENTATION_ANALYSIS_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    /// 从 INI 配置文件加载配置
    fn load_from_file(config_path: &Path) -> Result<AnalysisConfig> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }

        let mut config_parser = configparser::ini::Ini::new();
        config_parser
            .load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        let get_path = |section: &str, key: &str| -> Option<PathBuf> {
            config_parser
                .get(section, key)
                .or_else(|| config_parser.get("DEFAULT", key))
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };

        let transcriber_url = config_parser
            .get("speech", "transcriber_url")
            .or_else(|| config_parser.get("DEFAULT", "transcriber_url"))
            .filter(|v| !v.is_empty());

        let modality_timeout_secs = config_parser
            .get("analysis", "timeout_secs")
            .or_else(|| config_parser.get("DEFAULT", "timeout_secs"))
            .and_then(|v| v.parse().ok());

        let defaults = AnalysisConfig::default();
        Ok(AnalysisConfig {
            workspace_root: get_path("analysis", "workspace"),
            face_model: get_path("models", "face_model"),
            emotion_model: get_path("models", "emotion_model"),
            pose_model: get_path("models", "pose_model"),
            openpose_bin: get_path("openpose", "binary"),
            transcriber_url: transcriber_url.unwrap_or(defaults.transcriber_url),
            modality_timeout_secs: modality_timeout_secs.unwrap_or(defaults.modality_timeout_secs),
        })
    }

    /// 从默认位置加载配置文件
    fn load_from_default_locations() -> Result<AnalysisConfig> {
        // 1. 当前目录的 presentation-analysis.ini
        let current_dir_config = PathBuf::from("presentation-analysis.ini");
        if current_dir_config.exists() {
            return Self::load_from_file(&current_dir_config);
        }

        // 2. 当前目录的 .presentation-analysis.ini
        let hidden_config = PathBuf::from(".presentation-analysis.ini");
        if hidden_config.exists() {
            return Self::load_from_file(&hidden_config);
        }

        // 3. 用户主目录的 .presentation-analysis.ini
        if let Some(home) = env::var_os("HOME") {
            let home_config = PathBuf::from(home).join(".presentation-analysis.ini");
            if home_config.exists() {
                return Self::load_from_file(&home_config);
            }
        }

        // 4. /etc/presentation-analysis.ini (Linux/macOS)
        let etc_config = PathBuf::from("/etc/presentation-analysis.ini");
        if etc_config.exists() {
            return Self::load_from_file(&etc_config);
        }

        Err(anyhow::anyhow!("未找到配置文件"))
    }
}

/// 环境变量中读到的部分配置
struct PartialConfig {
    workspace_root: Option<PathBuf>,
    face_model: Option<PathBuf>,
    emotion_model: Option<PathBuf>,
    pose_model: Option<PathBuf>,
    openpose_bin: Option<PathBuf>,
    transcriber_url: Option<String>,
    modality_timeout_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AnalysisConfig::default();
        assert_eq!(config.transcriber_url, "http://127.0.0.1:8090");
        assert_eq!(config.modality_timeout_secs, 300);
        assert!(config.openpose_bin.is_none());
    }

    #[test]
    fn test_cli_overrides_file() {
        let config_path = std::env::temp_dir().join(format!(
            "presentation-analysis-config-{}.ini",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(
            &config_path,
            "[openpose]\nbinary = /opt/openpose/from-file\n[analysis]\ntimeout_secs = 60\n",
        )
        .unwrap();

        let config = ConfigLoader::load_config(
            Some(&config_path),
            Some(PathBuf::from("/opt/openpose/from-cli")),
            None,
            None,
        )
        .unwrap();

        assert_eq!(
            config.openpose_bin,
            Some(PathBuf::from("/opt/openpose/from-cli"))
        );
        // 命令行没有覆盖的字段取配置文件的值
        assert_eq!(config.modality_timeout_secs, 60);

        std::fs::remove_file(&config_path).ok();
    }

    #[test]
    fn test_missing_file_is_error() {
        let missing = PathBuf::from("/definitely/not/here.ini");
        assert!(ConfigLoader::load_from_file(&missing).is_err());
    }
}
