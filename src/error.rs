use thiserror::Error;

/// 单个分析维度的错误
///
/// 任何一个维度失败都不会导致整个请求失败，错误只会被记录到
/// 分析报告的 errors 列表中。
#[derive(Debug, Error)]
pub enum ModalityError {
    /// 模型或外部程序未加载/未配置，该维度不可用
    #[error("能力不可用: {0}")]
    Unavailable(String),

    /// 视频无法打开解码
    #[error("无法打开视频解码: {0}")]
    OpenFailed(String),

    /// 视频不包含音频轨
    #[error("视频不包含音频轨")]
    NoAudioTrack,

    /// 分析执行过程中的运行时错误
    #[error("分析执行失败: {0}")]
    Execution(String),

    /// 超过单个维度的时间上限
    #[error("分析超时（{0} 秒）")]
    Timeout(u64),
}

impl ModalityError {
    /// 维度是否从未真正尝试过（模型缺失、视频打不开）
    ///
    /// 这类错误在报告中记为 "N/A"，其余记为 "Error"。
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ModalityError::Unavailable(_) | ModalityError::OpenFailed(_)
        )
    }
}

/// 请求级错误，会使整个分析请求失败
#[derive(Debug, Error)]
pub enum RequestError {
    /// 请求本身无效（缺少上传文件、文件为空），对应 HTTP 400
    #[error("请求无效: {0}")]
    BadRequest(String),

    /// 维度边界之外的失败（如上传文件无法落盘），对应 HTTP 500
    #[error("服务器内部错误: {0}")]
    Internal(String),
}
