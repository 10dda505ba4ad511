//! 演讲视频多维度质量分析
//!
//! 对上传的演讲视频做四个互相独立的感知维度分析：
//! 面部表情、身体姿态可见性、语速与口头禅、外部 OpenPose
//! 检测一致性，并聚合为一份 0-100 的评分报告。任何单个维度
//! 的失败只体现在报告里，不会使请求失败。

pub mod config;
pub mod emotion;
pub mod error;
pub mod frame_sampler;
pub mod handler;
pub mod openpose;
pub mod pipeline;
pub mod posture;
pub mod report;
pub mod speech;
pub mod workspace;

pub use config::AnalysisConfig;
pub use error::{ModalityError, RequestError};
pub use pipeline::AnalysisServices;
pub use report::AnalysisReport;
