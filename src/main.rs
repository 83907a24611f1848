use actix_web::{web, App, HttpServer};
use actix_cors::Cors;
use storefront_auth::{AppState, Settings};
use storefront_auth::config::CorsConfig;
use dotenv::dotenv;
use std::net::TcpListener;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn cors(config: &CorsConfig) -> Cors {
    if !config.enabled {
        // CORS disabled - use most restrictive settings
        return Cors::default();
    }

    let cors = if config.allow_any_origin {
        Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .supports_credentials()
    } else {
        config.allowed_origins.iter().fold(
            Cors::default()
                .allowed_methods(vec!["GET", "POST"])
                .allowed_headers(vec!["Authorization", "Content-Type"])
                .supports_credentials(),
            |cors, origin| cors.allowed_origin(origin),
        )
    };

    cors.max_age(config.max_age as usize)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();

    let config = Settings::new()?;
    info!("Configuration loaded successfully ({})", config.environment);

    let state = web::Data::new(AppState::new(config.clone())?);

    // Limiter expiry is lazy; this only keeps idle identifiers from piling up.
    let sweep_state = state.clone();
    let sweep_every = Duration::from_secs(config.rate_limit.sweep_interval_secs.max(1));
    actix_rt::spawn(async move {
        let mut interval = actix_rt::time::interval(sweep_every);
        loop {
            interval.tick().await;
            let evicted = sweep_state.auth_service.purge_expired();
            debug!("Rate limiter sweep evicted {} record(s)", evicted);
        }
    });

    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))?;
    info!("Starting server at {}:{}", config.server.host, config.server.port);

    HttpServer::new(move || {
        App::new()
            .wrap(cors(&config.cors))
            .app_data(state.clone())
            .configure(storefront_auth::routes)
    })
    .listen(listener)?
    .workers(config.server.workers as usize)
    .run()
    .await?;

    Ok(())
}
