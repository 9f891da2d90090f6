//! API server entry point.

use pharmintel_core::{api, Engine, EngineConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let engine = match Engine::from_config(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("startup error: {}", e);
            std::process::exit(1);
        }
    };

    // Retention runs on a daily schedule alongside the API.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
            interval.tick().await;
            loop {
                interval.tick().await;
                match engine.retention().run(false).await {
                    Ok(report) => tracing::info!(
                        eligible = report.total_eligible(),
                        "scheduled retention run complete"
                    ),
                    Err(e) => tracing::error!(error = %e, "scheduled retention run failed"),
                }
            }
        });
    }

    if let Err(e) = api::serve(engine).await {
        eprintln!("server error: {}", e);
        std::process::exit(1);
    }
}
