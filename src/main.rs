use survey_agent::create_app_router;
use survey_agent::init::app_init;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("🚀 Starting survey summary agent...");
    let (config, state) = app_init().await?;
    log::info!("✅ Application state initialized");
    let app = create_app_router(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    log::info!("");
    log::info!("🎉 Server started!");
    log::info!("📍 http://{}", addr);
    log::info!("📡 Survey stream: POST http://{}/api/agent-survey", addr);
    log::info!("🛑 Cancel: DELETE http://{}/api/agent-survey/{{request_id}}", addr);
    log::info!("❤️  Health: http://{}/health", addr);
    log::info!("");

    axum::serve(listener, app).await?;

    Ok(())
}
