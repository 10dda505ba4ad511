use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use crate::error::RequestError;
use crate::pipeline::{self, AnalysisServices};
use crate::workspace::RequestWorkspace;

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status = match &self {
            RequestError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RequestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// POST /api/analyze
///
/// 接收 multipart 表单中字段名为 "video" 的上传文件，落盘到
/// 请求工作区后跑完整分析。除了请求本身无效（400）或落盘失败
/// （500），任何维度的失败都不会使请求失败。
pub async fn handle_analyze(
    State(services): State<Arc<AnalysisServices>>,
    mut multipart: Multipart,
) -> Result<Response, RequestError> {
    // 从表单中找到视频文件字段
    let mut upload: Option<(String, axum::body::Bytes)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RequestError::BadRequest(format!("解析 multipart 表单失败: {}", e)))?
    {
        if field.name() != Some("video") {
            continue;
        }
        let filename = field
            .file_name()
            .map(|s| s.to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RequestError::BadRequest("上传文件缺少文件名".to_string()))?;
        let data = field
            .bytes()
            .await
            .map_err(|e| RequestError::BadRequest(format!("读取上传内容失败: {}", e)))?;
        upload = Some((filename, data));
        break;
    }

    let (filename, data) =
        upload.ok_or_else(|| RequestError::BadRequest("缺少 video 文件字段".to_string()))?;
    if data.is_empty() {
        return Err(RequestError::BadRequest("上传的视频文件为空".to_string()));
    }

    // 只保留文件名部分，丢弃客户端可能带上的路径
    let safe_name = std::path::Path::new(&filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.mp4")
        .to_string();

    let workspace = RequestWorkspace::create(&services.config.workspace_root())
        .map_err(|e| RequestError::Internal(e.to_string()))?;
    let video_path = workspace.video_path(&safe_name);
    tokio::fs::write(&video_path, &data)
        .await
        .map_err(|e| RequestError::Internal(format!("保存上传视频失败: {}", e)))?;

    info!(
        "📥 收到分析请求 [{}]: {} ({} 字节)",
        workspace.request_id(),
        safe_name,
        data.len()
    );

    let report = pipeline::analyze_video(services, &video_path, &workspace).await;
    if !report.errors.is_empty() {
        error!(
            "分析请求 [{}] 存在部分失败: {:?}",
            workspace.request_id(),
            report.errors
        );
    }

    Ok(Json(report).into_response())
}

/// GET / 和 GET /health
pub async fn health_check() -> &'static str {
    "OK"
}
