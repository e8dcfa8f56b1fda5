//! Relay tests against a live local upstream: header hygiene in both
//! directions, body deadlines, and failure mapping.

use std::time::{Duration, Instant};

use actix_web::{test, web, App, HttpRequest, HttpResponse, HttpServer};

use satgate_gateway::config::{ConfigDoc, GatewayConfig, Secrets};
use satgate_gateway::routes;
use satgate_gateway::AppState;

async fn echo(req: HttpRequest) -> HttpResponse {
    let seen: Vec<String> = req
        .headers()
        .iter()
        .map(|(name, _)| name.as_str().to_string())
        .collect();
    HttpResponse::Ok()
        .insert_header(("x-internal-secret", "do-not-relay"))
        .append_header(("set-cookie", "a=1"))
        .append_header(("set-cookie", "b=2"))
        .json(serde_json::json!({ "seen": seen }))
}

/// Four bytes, one every 700ms: well past a one-second deadline.
async fn drip() -> HttpResponse {
    let chunks = futures::stream::unfold(0u32, |sent| async move {
        if sent >= 4 {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(700)).await;
        Some((
            Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"x")),
            sent + 1,
        ))
    });
    HttpResponse::Ok().streaming(chunks)
}

async fn spawn_upstream() -> u16 {
    let server = HttpServer::new(|| {
        App::new()
            .route("/api/echo", web::get().to(echo))
            .route("/api/drip", web::get().to(drip))
    })
    .workers(1)
    .disable_signals()
    .bind(("127.0.0.1", 0))
    .unwrap();
    let port = server.addrs()[0].port();
    actix_web::rt::spawn(server.run());
    port
}

fn make_state(upstream_port: u16) -> web::Data<AppState> {
    let yaml = format!(
        r#"
upstreams:
  live:
    url: http://127.0.0.1:{upstream_port}
    timeout_secs: 1
    response_headers_deny:
      - x-internal-secret
  dead:
    url: http://127.0.0.1:1
routes:
  - name: relay
    path:
      prefix: /api/
    policy:
      kind: public
    upstream: live
  - name: dead
    path:
      prefix: /dead/
    policy:
      kind: public
    upstream: dead
"#
    );
    let doc: ConfigDoc = serde_yaml::from_str(&yaml).unwrap();
    let secrets = Secrets {
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
async fn headers_are_scrubbed_in_both_directions() {
    let port = spawn_upstream().await;
    let app = test::init_service(data_plane(make_state(port))).await;

    let req = test::TestRequest::get()
        .uri("/api/echo")
        .insert_header(("authorization", "Bearer gateway-credential"))
        .insert_header(("cookie", "session=1"))
        .insert_header(("accept", "application/json"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    // Deny-listed response headers stay behind; the gateway's own
    // annotations arrive.
    assert!(resp.headers().get("x-internal-secret").is_none());
    assert!(resp.headers().get("x-request-id").is_some());
    assert_eq!(resp.headers().get("x-satgate-route").unwrap(), "relay");

    // Repeated response headers all survive the relay.
    let cookies: Vec<&str> = resp
        .headers()
        .get_all("set-cookie")
        .map(|v| v.to_str().unwrap())
        .collect();
    assert_eq!(cookies, ["a=1", "b=2"]);

    // The upstream saw allow-listed headers plus the request id, and
    // never the credentials presented to the gateway.
    let body: serde_json::Value = test::read_body_json(resp).await;
    let seen: Vec<&str> = body["seen"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(seen.contains(&"accept"), "got: {seen:?}");
    assert!(seen.contains(&"x-request-id"), "got: {seen:?}");
    assert!(!seen.contains(&"authorization"), "got: {seen:?}");
    assert!(!seen.contains(&"cookie"), "got: {seen:?}");
}

#[actix_rt::test]
async fn slow_body_is_cut_off_at_the_upstream_deadline() {
    let port = spawn_upstream().await;
    let app = test::init_service(data_plane(make_state(port))).await;

    let started = Instant::now();
    let req = test::TestRequest::get().uri("/api/drip").to_request();
    let resp = test::call_service(&app, req).await;
    // Headers arrive before the deadline, so the status is already out.
    assert_eq!(resp.status(), 200);

    // The one-second deadline covers the body too: relaying must abort
    // instead of dribbling all four chunks over ~2.8s.
    let body = actix_web::body::to_bytes(resp.into_body()).await;
    assert!(body.is_err(), "relay should abort, not complete");
    assert!(
        started.elapsed() < Duration::from_millis(2500),
        "relay held the connection past the deadline: {:?}",
        started.elapsed()
    );
}

#[actix_rt::test]
async fn unreachable_upstream_maps_to_502() {
    let port = spawn_upstream().await;
    let app = test::init_service(data_plane(make_state(port))).await;

    let req = test::TestRequest::get().uri("/dead/x").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 502);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "bad_gateway");
}
