// 图库批量上传命令行入口
//
// 用法: gallery-uploader <图库ID> [--section 分区] <文件路径>...
// 配置从 config/app.toml 加载，缺失时落到默认值并写回

use anyhow::Result;
use gallery_uploader_rust::config::{AppConfig, LogConfig};
use gallery_uploader_rust::logging;
use gallery_uploader_rust::uploader::{
    build_requests, TaskState, UploadListener, UploadOutcome, UploadScheduler,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const CONFIG_PATH: &str = "config/app.toml";

/// 命令行参数
#[derive(Debug, PartialEq, Eq)]
struct CliArgs {
    gallery_id: String,
    section: Option<String>,
    paths: Vec<PathBuf>,
}

/// 解析命令行参数
///
/// 第一个位置参数为图库ID，其余位置参数为文件路径
fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut gallery_id = None;
    let mut section = None;
    let mut paths = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--section" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--section 需要一个参数"))?;
                section = Some(value.clone());
            }
            _ if gallery_id.is_none() => gallery_id = Some(arg.clone()),
            _ => paths.push(PathBuf::from(arg)),
        }
    }

    let gallery_id = gallery_id
        .ok_or_else(|| anyhow::anyhow!("缺少图库ID\n{}", USAGE))?;
    if paths.is_empty() {
        anyhow::bail!("缺少要上传的文件\n{}", USAGE);
    }

    Ok(CliArgs {
        gallery_id,
        section,
        paths,
    })
}

const USAGE: &str = "用法: gallery-uploader <图库ID> [--section 分区] <文件路径>...";

/// 控制台进度监听器
///
/// 终态结果由主循环打印，这里只负责过程中的进度与状态日志
struct ConsoleListener;

impl UploadListener for ConsoleListener {
    fn on_progress(&self, task_id: &str, bytes_sent: u64, total_bytes: u64) {
        debug!(
            "任务 {} 进度: {} / {}",
            task_id,
            format_bytes(bytes_sent),
            format_bytes(total_bytes)
        );
    }

    fn on_batch_progress(&self, bytes_sent: u64, grand_total: u64, bytes_per_sec: u64) {
        let percent = if grand_total > 0 {
            bytes_sent as f64 / grand_total as f64 * 100.0
        } else {
            100.0
        };
        info!(
            "总进度: {:.1}% ({} / {}) 速度 {}/s",
            percent,
            format_bytes(bytes_sent),
            format_bytes(grand_total),
            format_bytes(bytes_per_sec)
        );
    }

    fn on_state_changed(&self, task_id: &str, state: TaskState) {
        debug!("任务 {} 状态: {:?}", task_id, state);
    }
}

/// 字节数可读化
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// 加载日志配置
///
/// 尝试从配置文件加载，失败时返回默认配置
async fn load_log_config() -> LogConfig {
    // 尝试读取配置文件中的日志配置
    if let Ok(content) = tokio::fs::read_to_string(CONFIG_PATH).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }

    // 返回默认配置
    LogConfig::default()
}

#[tokio::main]
async fn main() -> Result<()> {
    // 🔥 先尝试加载日志配置，失败时使用默认配置
    let log_config = load_log_config().await;

    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&log_config);

    info!(
        "Gallery Uploader Rust v{} 启动中...",
        env!("CARGO_PKG_VERSION")
    );

    let args = parse_args(&std::env::args().skip(1).collect::<Vec<_>>())?;
    let config = AppConfig::load_or_default(CONFIG_PATH).await;

    // 读取文件元数据，不可读的文件单独上报后继续
    let (requests, unreadable) =
        build_requests(&args.gallery_id, args.section.clone(), &args.paths).await;
    for (path, e) in &unreadable {
        error!("🔥 无法读取文件 {:?}: {}", path, e);
    }
    if requests.is_empty() {
        anyhow::bail!("没有可上传的文件");
    }

    info!(
        "准备上传 {} 个文件到图库 {}",
        requests.len(),
        args.gallery_id
    );

    let scheduler = UploadScheduler::from_config(&config, Arc::new(ConsoleListener))?;
    let mut handle = scheduler.submit(requests);

    // 🔥 Ctrl+C 触发整批协作式取消
    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到 Ctrl+C，正在取消所有上传...");
            cancel.cancel();
        }
    });

    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut cancelled = 0usize;

    while let Some(outcome) = handle.next_outcome().await {
        let name = &outcome.request.display_name;
        match &outcome.outcome {
            UploadOutcome::Completed { asset_id } => {
                completed += 1;
                info!("✓ {} 上传完成, 资源ID: {}", name, asset_id);
            }
            UploadOutcome::Failed { error } => {
                failed += 1;
                error!("🔥 {} 上传失败: {}", name, error);
            }
            UploadOutcome::Cancelled => {
                cancelled += 1;
                warn!("{} 已取消", name);
            }
        }
    }

    let (sent, total) = handle.aggregate_bytes();
    let failed_total = failed + unreadable.len();
    info!(
        "上传结束: 成功 {}, 失败 {}, 取消 {} ({} / {})",
        completed,
        failed_total,
        cancelled,
        format_bytes(sent),
        format_bytes(total)
    );

    if failed_total > 0 {
        std::process::exit(1);
    }
    Ok(())
}
