use anyhow::Result;
use tracing::info;

use quiz_answer_relay::orchestrator::App;
use quiz_answer_relay::utils::logging;
use quiz_answer_relay::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    logging::init();

    // 加载配置：有 CONFIG_FILE 用 TOML，否则走环境变量
    let config = match std::env::var("CONFIG_FILE") {
        Ok(path) => Config::from_toml_file(&path)?,
        Err(_) => Config::from_env(),
    };

    let bind_addr = config.bind_addr.clone();

    // 初始化应用并挂载路由
    let app = App::initialize(config);
    let router = quiz_answer_relay::api::router(app);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("🌐 监听 {}", bind_addr);
    axum::serve(listener, router).await?;

    Ok(())
}
