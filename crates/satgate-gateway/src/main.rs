use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use satgate_gateway::cors::build_cors;
use satgate_gateway::metrics::register_metrics;
use satgate_gateway::routes;
use satgate_gateway::{AppState, GatewayConfig};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    register_metrics();

    let config = match GatewayConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };
    if config.dev_mode {
        tracing::warn!("SATGATE_INSECURE_DEV=true — dev relaxations are active");
    }
    if config.admin_secret.is_none() {
        tracing::warn!("admin plane is unauthenticated (dev mode)");
    }

    let data_addr = config.data_addr.clone();
    let admin_addr = config.admin_addr.clone();
    let rate_limit_rpm = config.rate_limit_rpm;
    let max_body_bytes = config.max_body_bytes;

    let state = match AppState::from_config(config) {
        Ok(state) => web::Data::new(state),
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    tracing::info!("SatGate data plane listening on {data_addr}");
    tracing::info!("SatGate admin plane listening on {admin_addr}");
    tracing::info!("Rate limit: {rate_limit_rpm} req/min per IP");
    tracing::info!("Routes configured: {}", state.config.routes.len());

    let governor_conf = GovernorConfigBuilder::default()
        .requests_per_minute(u64::from(rate_limit_rpm))
        .finish()
        .expect("failed to build rate limiter config");

    let data_state = state.clone();
    let data_plane = HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&data_state.config))
            .wrap(Governor::new(&governor_conf))
            .app_data(data_state.clone())
            .app_data(web::PayloadConfig::new(max_body_bytes))
            .default_service(web::route().to(routes::gateway::proxy_entry))
    })
    .bind(data_addr.as_str())?
    .run();

    let admin_state = state.clone();
    let admin_plane = HttpServer::new(move || {
        App::new()
            .app_data(admin_state.clone())
            .app_data(web::JsonConfig::default().limit(65_536))
            .route("/health", web::get().to(routes::health::health))
            .route("/metrics", web::get().to(routes::health::metrics))
            .route("/decision", web::post().to(routes::decision::evaluate))
            .route("/admin/tokens", web::post().to(routes::admin::mint_token))
            .route(
                "/admin/tokens/delegate",
                web::post().to(routes::admin::delegate_token),
            )
            .route("/admin/tiers", web::get().to(routes::admin::list_tiers))
    })
    .bind(admin_addr.as_str())?
    .run();

    futures::future::try_join(data_plane, admin_plane).await?;
    Ok(())
}
