use anyhow::{Context, Result};
use apihub_operator::config::OperatorConfig;
use apihub_operator::{crd_manifests, ApiHubOperator, RunOptions};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// ApiHub 控制面 Operator
#[derive(Debug, Parser)]
#[command(name = "apihub-operator", version, about)]
struct Cli {
    /// 配置文件路径（YAML 或 JSON）
    #[arg(short, long, env = "APIHUB_CONFIG")]
    config: Option<PathBuf>,

    /// 使用内存存储运行
    #[arg(long)]
    in_memory: bool,

    /// 本进程标识，缺省取主机名
    #[arg(long, env = "APIHUB_IDENTITY")]
    identity: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 运行控制器（默认）
    Run,
    /// 输出自定义资源定义
    Crds,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Crds) = cli.command {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    let config = OperatorConfig::load(cli.config.as_deref()).context("加载配置失败")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("无效的日志级别")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let identity = cli
        .identity
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| format!("apihub-{}", uuid::Uuid::new_v4()));
    info!(identity = %identity, in_memory = cli.in_memory, "启动 ApiHub Operator");

    let operator = ApiHubOperator::new(
        config,
        RunOptions {
            in_memory: cli.in_memory,
            identity,
        },
    )
    .await?;
    operator.start().await?;

    tokio::signal::ctrl_c().await.context("监听退出信号失败")?;
    info!("收到退出信号，正在停止");
    operator.stop().await
}
