mod common;

use actix_web::http::StatusCode;
use actix_web::{App, test as actix_test};
use chat_relay::server::{CHAT_PATHS, configure};
use common::mock_upstream::{FAILING_MODEL, MockUpstream};
use common::{TEST_API_KEY, proxy_config, proxy_parts};
use serde_json::{Value, json};

macro_rules! proxy_app {
    ($config:expr) => {{
        let config = $config;
        let (state, limiter) = proxy_parts(&config);
        let max = config.max_payload_size;
        actix_test::init_service(
            App::new().configure(move |cfg| configure(cfg, state, limiter, max)),
        )
        .await
    }};
}

fn hello_body() -> Value {
    json!({"messages": [{"role": "user", "content": "Hello"}]})
}

fn events(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .split_inclusive("\n\n")
        .map(str::to_string)
        .collect()
}

#[actix_web::test]
async fn test_invalid_request_never_reaches_upstream() {
    let upstream = MockUpstream::start().await;
    let app = proxy_app!(proxy_config(&upstream.url, Some(TEST_API_KEY)));

    let bad_bodies = [
        json!({}),
        json!({"messages": []}),
        json!({"messages": "hi"}),
        json!({"messages": [{"role": "tool", "content": "x"}]}),
        json!({"messages": [{"role": "user", "content": 42}]}),
        json!({"messages": [{"role": "user", "content": ""}]}),
    ];
    for body in bad_bodies {
        let req = actix_test::TestRequest::post()
            .uri("/api/ai-chat")
            .set_json(&body)
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body: {}", body);
        let json: Value = actix_test::read_body_json(resp).await;
        assert_eq!(json["error"]["type"], "invalid_request");
    }

    let req = actix_test::TestRequest::post()
        .uri("/api/ai-chat")
        .insert_header(("content-type", "application/json"))
        .set_payload("{not json")
        .to_request();
    let resp = actix_test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    assert_eq!(upstream.hits(), 0);
    upstream.stop().await;
}

#[actix_web::test]
async fn test_non_stream_passthrough_with_defaults() {
    let upstream = MockUpstream::start().await;
    let app = proxy_app!(proxy_config(&upstream.url, Some(TEST_API_KEY)));

    let req = actix_test::TestRequest::post()
        .uri("/ai-chat")
        .set_json(hello_body())
        .to_request();
    let resp = actix_test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("ratelimit-limit").unwrap().to_str().unwrap(),
        "50"
    );
    assert_eq!(
        resp.headers().get("ratelimit-remaining").unwrap().to_str().unwrap(),
        "49"
    );

    let json: Value = actix_test::read_body_json(resp).await;
    assert_eq!(json["model"], "mock/default-model");
    assert_eq!(json["echo"]["temperature"], 0.7);
    assert_eq!(json["echo"]["max_tokens"], 800);
    assert_eq!(json["echo"]["authorization"], format!("Bearer {}", TEST_API_KEY));
    assert_eq!(json["echo"]["referer"], "http://localhost:3000");
    assert_eq!(json["echo"]["title"], "chat-relay-tests");
    assert_eq!(json["choices"][0]["message"]["content"], "Hello from mock");
    assert_eq!(upstream.hits(), 1);

    upstream.stop().await;
}

#[actix_web::test]
async fn test_explicit_parameters_are_forwarded() {
    let upstream = MockUpstream::start().await;
    let app = proxy_app!(proxy_config(&upstream.url, Some(TEST_API_KEY)));

    let req = actix_test::TestRequest::post()
        .uri("/api/proxy/ai-chat")
        .set_json(json!({
            "messages": [
                {"role": "system", "content": "Be brief"},
                {"role": "user", "content": "Hi"}
            ],
            "model": "vendor/other-model",
            "temperature": 0.2,
            "max_tokens": 64
        }))
        .to_request();
    let resp = actix_test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let json: Value = actix_test::read_body_json(resp).await;
    assert_eq!(json["model"], "vendor/other-model");
    assert_eq!(json["echo"]["temperature"], 0.2);
    assert_eq!(json["echo"]["max_tokens"], 64);
    assert_eq!(json["echo"]["messages"][0]["role"], "system");

    upstream.stop().await;
}

#[actix_web::test]
async fn test_stream_is_normalized_and_terminated_once() {
    let upstream = MockUpstream::start().await;
    let app = proxy_app!(proxy_config(&upstream.url, Some(TEST_API_KEY)));

    let mut body = hello_body();
    body["stream"] = json!(true);
    let req = actix_test::TestRequest::post()
        .uri("/api/chat/ai-chat")
        .set_json(&body)
        .to_request();
    let resp = actix_test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "text/event-stream"
    );
    assert_eq!(
        resp.headers().get("cache-control").unwrap().to_str().unwrap(),
        "no-cache"
    );

    let body = actix_test::read_body(resp).await;
    let events = events(&body);
    assert_eq!(
        events,
        vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n".to_string(),
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n".to_string(),
            "data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n".to_string(),
            "data: not-json\n\n".to_string(),
            "data: [DONE]\n\n".to_string(),
        ]
    );

    let text: String = events
        .iter()
        .filter_map(|e| e.strip_prefix("data: "))
        .filter_map(|p| serde_json::from_str::<Value>(p.trim()).ok())
        .filter_map(|v| v["choices"][0]["delta"]["content"].as_str().map(String::from))
        .collect();
    assert_eq!(text, "Hello world");

    upstream.stop().await;
}

#[actix_web::test]
async fn test_upstream_error_is_passed_through() {
    let upstream = MockUpstream::start().await;
    let app = proxy_app!(proxy_config(&upstream.url, Some(TEST_API_KEY)));

    for stream in [false, true] {
        let mut body = hello_body();
        body["model"] = json!(FAILING_MODEL);
        body["stream"] = json!(stream);
        let req = actix_test::TestRequest::post()
            .uri("/ai-chat")
            .set_json(&body)
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            resp.headers().get("content-type").unwrap().to_str().unwrap(),
            "application/json"
        );
        let json: Value = actix_test::read_body_json(resp).await;
        assert_eq!(json["error"]["message"], "model overloaded");
    }

    upstream.stop().await;
}

#[actix_web::test]
async fn test_missing_api_key_is_server_error() {
    let upstream = MockUpstream::start().await;
    let app = proxy_app!(proxy_config(&upstream.url, None));

    let req = actix_test::TestRequest::post()
        .uri("/ai-chat")
        .set_json(hello_body())
        .to_request();
    let resp = actix_test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json: Value = actix_test::read_body_json(resp).await;
    assert_eq!(json["error"]["type"], "config_error");
    assert_eq!(upstream.hits(), 0);

    upstream.stop().await;
}

#[actix_web::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let app = proxy_app!(proxy_config(
        "http://127.0.0.1:1/v1/chat/completions",
        Some(TEST_API_KEY)
    ));

    let req = actix_test::TestRequest::post()
        .uri("/ai-chat")
        .set_json(hello_body())
        .to_request();
    let resp = actix_test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let json: Value = actix_test::read_body_json(resp).await;
    assert_eq!(json["error"]["type"], "transport_error");
}

#[actix_web::test]
async fn test_fifty_first_request_is_rate_limited() {
    let app = proxy_app!(proxy_config(
        "http://127.0.0.1:1/v1/chat/completions",
        Some(TEST_API_KEY)
    ));
    let client: std::net::SocketAddr = "10.1.2.3:40000".parse().unwrap();
    let other: std::net::SocketAddr = "10.9.9.9:40000".parse().unwrap();

    // Invalid bodies still count against the window.
    for i in 0..50 {
        let req = actix_test::TestRequest::post()
            .uri("/ai-chat")
            .peer_addr(client)
            .set_json(json!({"messages": []}))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "request {}", i + 1);
    }

    let req = actix_test::TestRequest::post()
        .uri("/api/ai-chat")
        .peer_addr(client)
        .set_json(json!({"messages": []}))
        .to_request();
    let resp = actix_test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().get("retry-after").is_some());
    let json: Value = actix_test::read_body_json(resp).await;
    assert_eq!(json["error"]["type"], "rate_limited");

    let req = actix_test::TestRequest::post()
        .uri("/ai-chat")
        .peer_addr(other)
        .set_json(json!({"messages": []}))
        .to_request();
    let resp = actix_test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Ping is not limited.
    let req = actix_test::TestRequest::get()
        .uri("/ai-chat/ping")
        .peer_addr(client)
        .to_request();
    let resp = actix_test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn test_ping_on_every_alias_and_health() {
    let app = proxy_app!(proxy_config(
        "http://127.0.0.1:1/v1/chat/completions",
        None
    ));

    for path in CHAT_PATHS {
        let req = actix_test::TestRequest::get()
            .uri(&format!("{}/ping", path))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK, "path: {}", path);
        let json: Value = actix_test::read_body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"], "ai-chat");
        assert!(json["timestamp"].is_string());
    }

    let req = actix_test::TestRequest::get().uri("/health").to_request();
    let resp = actix_test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = actix_test::TestRequest::get().uri("/ai-chat").to_request();
    let resp = actix_test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}
