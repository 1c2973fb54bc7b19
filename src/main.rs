use anyhow::Result;
use cas_login::{
    cas::{helpers::create_http_client, CasLogin, HttpValidator, MemorySessions},
    web, AppLogin,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting CAS login service");

    // Load configuration from environment
    let config = cas_login::config::Config::load()?;
    tracing::info!(
        environment = ?config.environment,
        cas_sso_url = %config.cas_sso_url,
        service_url = ?config.service_url,
        "Configuration loaded"
    );

    let client = create_http_client(
        config.http_connect_timeout_secs,
        config.http_request_timeout_secs,
    )
    .map_err(|e| anyhow::anyhow!("Failed to build HTTP client for ticket validation: {}", e))?;

    let sessions = MemorySessions::new(config.cookie_settings());
    let validator = HttpValidator::new(&config.cas_sso_url, client);
    let login: Arc<AppLogin> = Arc::new(
        CasLogin::new(&config.cas_sso_url, sessions, validator)
            .with_url(config.service_url_resolver()?),
    );

    let app = web::create_router(login);

    // Bind and serve
    let bind_address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("CAS login service listening on {}", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
