use anyhow::{Context, Result};
use llm_limiter::{
    cli::{Cli, Commands},
    config::{self, AppConfig},
    infra::database::mask_database_url,
    logging,
    repository::apply_migrations,
    LimiterApp,
};
use std::fs;
use std::process;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载 .env 文件（如果存在）
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // 不需要完整启动的子命令
    match &cli.command {
        Some(Commands::GenerateConfig { path }) => return generate_config(path),
        Some(Commands::ValidateConfig { path }) => return validate_config(path),
        Some(Commands::ShowConfig) => return show_config(&cli),
        _ => {}
    }

    // 快速读取 config.toml 的 [logging] 段（不加载完整配置）
    let early_log = config::load_early_logging_config(cli.config_file.as_deref());

    // 合并日志配置（优先级：CLI > config.toml > 默认值）
    let log_level = cli
        .get_log_level()
        .or(early_log.level)
        .unwrap_or_else(|| "info".to_string());
    let log_format = cli.get_log_format().or(early_log.format);
    let log_file = cli.log_file.clone().or(early_log.file);

    // guard 必须存活到进程结束，否则文件日志会丢失
    let _log_guard = logging::init_logging(
        &log_level,
        log_format.as_deref(),
        log_file.as_deref(),
        cli.quiet,
    )?;

    // 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    let config = AppConfig::load(&cli).context("加载配置失败")?;

    if cli.dev {
        tracing::info!("🔧 开发模式已启用");
    }

    match cli.command.clone() {
        Some(Commands::Migrate) => return run_migrate(&config).await,
        Some(Commands::Cleanup { days }) => {
            let days = days.unwrap_or(config.retention_days);
            let app = build_app(config).await;
            app.cleanup(days).await.context("清理请求记录失败")?;
            return Ok(());
        }
        _ => {}
    }

    let worker_only = cli.command == Some(Commands::Worker);
    let with_worker = matches!(cli.command, Some(Commands::Serve { with_worker: true }));

    tracing::info!("🚀 LLM Limiter starting...");
    let app = build_app(config).await;

    let result = if worker_only {
        app.run_worker().await
    } else {
        app.serve(with_worker).await
    };

    if let Err(e) = result {
        tracing::error!("❌ 服务运行失败: {}", e);
        process::exit(1);
    }

    Ok(())
}

/// 创建应用（Redis/数据库连接失败会打印错误并退出）
async fn build_app(config: AppConfig) -> LimiterApp {
    match LimiterApp::build(config).await {
        Ok(app) => app,
        Err(e) => {
            tracing::error!("❌ 服务初始化失败: {}", e);
            tracing::error!("💡 请检查配置、Redis 与数据库连接后重试");
            process::exit(1);
        }
    }
}

/// 生成默认配置文件
fn generate_config(path: &str) -> Result<()> {
    fs::write(path, config::DEFAULT_CONFIG_TOML)
        .with_context(|| format!("无法写入配置文件: {}", path))?;

    println!("✅ 配置文件已生成: {}", path);
    Ok(())
}

/// 验证配置文件
fn validate_config(path: &str) -> Result<()> {
    let config = AppConfig::from_toml_file(path)
        .and_then(|config| config.validate().map(|_| config))
        .with_context(|| format!("配置文件验证失败: {}", path))?;

    println!("✅ 配置文件有效: {}", path);
    println!("📊 配置摘要:");
    println!("  - HTTP: {}", config.bind_address());
    println!("  - Redis: {}", config.redis.is_some());
    println!("  - Database: {}", config.database.is_some());
    for (category, limit) in &config.admission.limits {
        println!("  - 并发上限 {}: {}", category, limit);
    }

    Ok(())
}

/// 执行数据库迁移
async fn run_migrate(config: &AppConfig) -> Result<()> {
    let database = config
        .database
        .as_ref()
        .context("需要 DATABASE_URL，请在 .env、环境变量或配置文件中配置")?;

    println!("🔌 连接数据库 {}...", mask_database_url(&database.url));
    let pool = sqlx::PgPool::connect(&database.url)
        .await
        .context("数据库连接失败，请检查 DATABASE_URL")?;

    let report = apply_migrations(&pool).await?;
    for name in &report.skipped {
        println!("  ⏭ {} (已执行，跳过)", name);
    }
    for name in &report.applied {
        println!("  ✅ {} 完成", name);
    }

    if report.applied.is_empty() {
        println!("✅ 数据库已是最新，无需迁移");
    } else {
        println!("✅ 成功执行 {} 个迁移", report.applied.len());
    }

    pool.close().await;
    Ok(())
}

/// 显示最终配置（合并后的配置）
fn show_config(cli: &Cli) -> Result<()> {
    // 初始化基本日志（用于显示配置）
    let _guard = logging::init_logging("info", None, None, false)?;

    let config = AppConfig::load(cli).context("加载配置失败")?;

    println!("📊 最终配置（合并后的配置）:");
    println!("{}", serde_json::to_string_pretty(&config)?);

    Ok(())
}
