//! 维护入口
//! 执行数据库迁移、余额对账与休假汇总

use std::sync::Arc;
use std::time::Duration;

use leave_attendance::{
    config::AppConfig,
    db,
    events::EventBus,
    models::leave::LeaveSummaryFilters,
    repository::PgLeaveRepository,
    services::{LeaveLedger, LeaveService, LeaveSettings},
    telemetry,
};

enum Command {
    Migrate,
    Reconcile,
    Summary(LeaveSummaryFilters),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ===== CLI 参数处理 =====
    let args: Vec<String> = std::env::args().collect();

    let command = match args.get(1).map(String::as_str) {
        Some("--version") => {
            println!("leave-attendance {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some("--help") | None => {
            print_help();
            return Ok(());
        }
        Some("migrate") => Command::Migrate,
        Some("reconcile") => Command::Reconcile,
        Some("summary") => Command::Summary(LeaveSummaryFilters {
            from: args.get(2).cloned(),
            to: args.get(3).cloned(),
        }),
        Some(other) => {
            eprintln!("未知参数: {}", other);
            print_help();
            std::process::exit(1);
        }
    };

    // 加载 .env 文件（开发环境）
    // 按优先级加载：.env.local > .env.development > .env
    if let Ok(env) = std::env::var("LA_ENV") {
        dotenv::from_filename(format!(".env.{}", env)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::from_filename(".env.development").ok();
        dotenv::dotenv().ok();
    }

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志与指标
    telemetry::init_telemetry(&config.logging);
    telemetry::init_metrics();

    // 3. 数据库连接池
    let pool = db::create_pool(&config.database).await?;
    db::record_pool_metrics(&pool);

    match command {
        Command::Migrate => {
            db::run_migrations(&pool).await?;
        }
        Command::Reconcile => {
            let ledger = LeaveLedger::new(
                Arc::new(PgLeaveRepository::new(pool.clone())),
                config.leave.negative_balance,
                Duration::from_secs(config.store.timeout_secs),
            );
            let report = ledger.reconcile().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if !report.is_clean() {
                pool.close().await;
                std::process::exit(2);
            }
        }
        Command::Summary(filters) => {
            let leave = LeaveService::new(
                Arc::new(PgLeaveRepository::new(pool.clone())),
                EventBus::new(config.sync.channel_capacity),
                LeaveSettings::from_config(&config)?,
            );
            let report = leave.summary(filters).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    pool.close().await;
    Ok(())
}

/// 打印帮助信息
fn print_help() {
    println!("leave-attendance {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: leave-attendance <命令>");
    println!();
    println!("命令:");
    println!("  migrate       执行数据库迁移");
    println!("  reconcile     将 NULL 余额归零并报告负余额");
    println!("  summary [起始日期] [结束日期]");
    println!("                按休假策略汇总申请（日期格式 YYYY-MM-DD）");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 LA_ 前缀的环境变量完成，例如 LA_DATABASE__URL");
}
