//! Wire-level tests of the data and admin planes.

use actix_web::{test, web, App};

use satgate_gateway::config::{ConfigDoc, GatewayConfig, Secrets};
use satgate_gateway::routes;
use satgate_gateway::AppState;

const YAML: &str = r#"
l402:
  tiers:
    micro: 5
upstreams:
  api:
    url: http://127.0.0.1:1
routes:
  - name: paid
    path: { prefix: /paid/ }
    policy:
      kind: l402
      tier: micro
      scope: "api:paid:read"
      max_calls: 10
    upstream: api
  - name: blocked
    path: { exact: /blocked }
    policy: { kind: deny, status: 451 }
"#;

fn make_state(metrics_token: Option<&str>) -> web::Data<AppState> {
    let doc: ConfigDoc = serde_yaml::from_str(YAML).unwrap();
    let secrets = Secrets {
        root_key_hex: Some(hex::encode([3u8; 32])),
        metrics_token: metrics_token.map(|s| s.to_string()),
        dev_mode: true,
        ..Default::default()
    };
    let config = GatewayConfig::compile(doc, secrets).unwrap();
    web::Data::new(AppState::from_config(config).unwrap())
}

fn data_plane(
    state: web::Data<AppState>,
) -> App<
    impl actix_web::dev::ServiceFactory<
        actix_web::dev::ServiceRequest,
        Config = (),
        Response = actix_web::dev::ServiceResponse,
        Error = actix_web::Error,
        InitError = (),
    >,
> {
    App::new()
        .app_data(state)
        .default_service(web::route().to(routes::gateway::proxy_entry))
}

#[actix_rt::test]
async fn unauthenticated_request_gets_a_402_with_l402_header() {
    let app = test::init_service(data_plane(make_state(None))).await;

    let req = test::TestRequest::get().uri("/paid/data").to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 402);
    let challenge = resp
        .headers()
        .get("www-authenticate")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(challenge.starts_with("L402 macaroon=\""), "got: {challenge}");
    assert!(challenge.contains(", invoice=\""));
    assert_eq!(resp.headers().get("x-l402-tier").unwrap(), "micro");
    assert_eq!(resp.headers().get("x-l402-price-sats").unwrap(), "5");
    assert_eq!(resp.headers().get("x-l402-max-calls").unwrap(), "10");

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "payment_required");
    assert_eq!(body["price_sats"], 5);
    assert!(body["payment_hash"].as_str().unwrap().len() == 64);
}

#[actix_rt::test]
async fn deny_routes_answer_with_their_status_and_json_shape() {
    let app = test::init_service(data_plane(make_state(None))).await;

    let req = test::TestRequest::get().uri("/blocked").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 451);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "policy_deny");

    // Anything off the route table is a 403, not a passthrough.
    let req = test::TestRequest::get().uri("/unknown").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "no_route");
}

#[actix_rt::test]
async fn garbage_authorization_is_a_challenge_not_an_error() {
    let app = test::init_service(data_plane(make_state(None))).await;

    let req = test::TestRequest::get()
        .uri("/paid/data")
        .insert_header(("authorization", "L402 not-a-token:ffff"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 402);
}

#[actix_rt::test]
async fn health_reports_ok_with_the_mock_backend() {
    let state = make_state(None);
    let app = test::init_service(
        App::new()
            .app_data(state)
            .route("/health", web::get().to(routes::health::health)),
    )
    .await;

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["lightning"]["ok"], true);
}

#[actix_rt::test]
async fn metrics_require_the_bearer_token_when_configured() {
    let state = make_state(Some("metrics-secret"));
    let app = test::init_service(
        App::new()
            .app_data(state)
            .route("/metrics", web::get().to(routes::health::metrics)),
    )
    .await;

    let req = test::TestRequest::get().uri("/metrics").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    let req = test::TestRequest::get()
        .uri("/metrics")
        .insert_header(("authorization", "Bearer wrong"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    let req = test::TestRequest::get()
        .uri("/metrics")
        .insert_header(("authorization", "Bearer metrics-secret"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
}

#[actix_rt::test]
async fn admin_plane_enforces_the_shared_secret() {
    let doc: ConfigDoc = serde_yaml::from_str(YAML).unwrap();
    let secrets = Secrets {
        root_key_hex: Some(hex::encode([3u8; 32])),
        admin_secret: Some("hunter2".to_string()),
        dev_mode: true,
        ..Default::default()
    };
    let config = GatewayConfig::compile(doc, secrets).unwrap();
    let state = web::Data::new(AppState::from_config(config).unwrap());
    let app = test::init_service(
        App::new()
            .app_data(state)
            .route("/admin/tokens", web::post().to(routes::admin::mint_token))
            .route("/admin/tiers", web::get().to(routes::admin::list_tiers)),
    )
    .await;

    let req = test::TestRequest::get().uri("/admin/tiers").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    let req = test::TestRequest::get()
        .uri("/admin/tiers")
        .insert_header(("x-admin-secret", "hunter2"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["tiers"]["micro"], 5);

    let req = test::TestRequest::post()
        .uri("/admin/tokens")
        .insert_header(("x-admin-secret", "wrong"))
        .set_json(serde_json::json!({"scope": "api:x:read"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
}
