use actix_cors::Cors;

use crate::config::GatewayConfig;

/// CORS for the data plane. Origins come from config; the compile step
/// already rejected a wildcard outside dev mode. With no configured origins,
/// only localhost is allowed.
pub fn build_cors(config: &GatewayConfig) -> Cors {
    let mut cors = if config.cors_origins.is_empty() {
        Cors::default().allowed_origin_fn(|origin, _| {
            origin
                .to_str()
                .map(|o| o == "http://localhost" || o.starts_with("http://localhost:"))
                .unwrap_or(false)
        })
    } else if config.cors_origins.iter().any(|o| o == "*") {
        Cors::default().allow_any_origin()
    } else {
        let mut cors = Cors::default();
        for origin in &config.cors_origins {
            cors = cors.allowed_origin(origin);
        }
        cors
    };

    cors = cors
        .allow_any_method()
        .allowed_headers(vec!["content-type", "authorization", "accept"])
        .expose_headers(vec![
            "www-authenticate",
            "x-request-id",
            "x-calls-remaining",
            "x-budget-remaining",
            "x-l402-price-sats",
            "x-l402-tier",
            "x-l402-reason",
        ])
        .max_age(3600);
    cors
}
