use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use presentation_analysis::config::ConfigLoader;
use presentation_analysis::handler;
use presentation_analysis::pipeline::{self, AnalysisServices};
use presentation_analysis::workspace::RequestWorkspace;

/// 上传体积上限（512MB）
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "presentation-analysis")]
#[command(about = "演讲视频多维度质量分析服务", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 分析单个本地视频文件并输出 JSON 报告
    Analyze {
        /// 视频文件路径
        input: PathBuf,

        /// 配置文件路径（INI 格式）
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// OpenPose 可执行文件路径
        #[arg(long)]
        openpose_bin: Option<PathBuf>,

        /// 转写服务地址
        #[arg(long)]
        transcriber_url: Option<String>,
    },

    /// 启动 HTTP 分析服务
    Serve {
        /// 监听地址
        #[arg(short, long)]
        bind: Option<String>,

        /// 配置文件路径（INI 格式）
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// OpenPose 可执行文件路径
        #[arg(long)]
        openpose_bin: Option<PathBuf>,

        /// 转写服务地址
        #[arg(long)]
        transcriber_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            input,
            config,
            openpose_bin,
            transcriber_url,
        } => {
            let config = ConfigLoader::load_config(
                config.as_deref(),
                openpose_bin,
                transcriber_url,
                None,
            )?;
            let services = Arc::new(AnalysisServices::from_config(config)?);

            let workspace = RequestWorkspace::create(&services.config.workspace_root())
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            let report = pipeline::analyze_video(services, &input, &workspace).await;

            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Serve {
            bind,
            config,
            openpose_bin,
            transcriber_url,
        } => {
            let config = ConfigLoader::load_config(
                config.as_deref(),
                openpose_bin,
                transcriber_url,
                None,
            )?;
            let services = Arc::new(AnalysisServices::from_config(config)?);

            let bind_addr = bind
                .or_else(|| {
                    std::env::var("PRESENTATION_ANALYSIS_PORT")
                        .ok()
                        .map(|port| format!("0.0.0.0:{}", port))
                })
                .unwrap_or_else(|| "0.0.0.0:9000".to_string());

            let app = Router::new()
                .route("/", get(handler::health_check))
                .route("/health", get(handler::health_check))
                .route("/api/analyze", post(handler::handle_analyze))
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
                .layer(CorsLayer::permissive())
                .with_state(services);

            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .with_context(|| format!("无法监听 {}", bind_addr))?;
            info!("🚀 分析服务已启动: http://{}", bind_addr);

            axum::serve(listener, app).await.context("HTTP 服务异常退出")?;
        }
    }

    Ok(())
}
