use rusty_variants::config;
use rusty_variants::http;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
  // Load config
  let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_owned());
  let cfg = config::parse(&config_path).expect("failed to parse config");

  // Initialize tracing
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "rusty_variants=debug,tower_http=debug".into()),
    )
    .with(
      tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact(),
    )
    .init();

  // Serve
  let (router, dispatcher) = http::bootstrap(&cfg)
    .await
    .expect("failed creating router");

  info!(listen = %cfg.app.listen, "server started");

  let served = http::run(router, &cfg.app).await;
  if let Err(e) = &served {
    error!("error running HTTP servers: {:#}", e);
  }

  // Let dispatched variant jobs finish before the runtime goes away
  dispatcher.shutdown(cfg.jobs.shutdown_grace()).await;

  if served.is_err() {
    std::process::exit(1);
  }
}
