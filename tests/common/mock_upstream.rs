use actix_web::dev::ServerHandle;
use actix_web::{App, HttpRequest, HttpResponse, HttpServer, web};
use serde_json::{Value, json};
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Model name that makes the mock answer with a 503.
pub const FAILING_MODEL: &str = "mock/overloaded";

/// Mixed-shape stream: a comment, one delta already in the outbound shape,
/// one `choices[].content`, one flat `text`, one non-JSON payload.
pub const STREAM_BODY: &str = concat!(
    ": OPENROUTER PROCESSING\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
    "data: {\"choices\":[{\"content\":\"lo\"}]}\n\n",
    "data: {\"text\":\" world\"}\n\n",
    "data: not-json\n\n",
    "data: [DONE]\n\n",
);

/// Stands in for the third-party chat completion endpoint.
pub struct MockUpstream {
    pub url: String,
    hits: Arc<AtomicUsize>,
    handle: ServerHandle,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let data = web::Data::new(hits.clone());

        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route("/v1/chat/completions", web::post().to(completions))
        })
        .workers(1)
        .disable_signals()
        .listen(listener)
        .unwrap()
        .run();

        let handle = server.handle();
        actix_web::rt::spawn(server);

        Self {
            url: format!("http://127.0.0.1:{}/v1/chat/completions", port),
            hits,
            handle,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub async fn stop(self) {
        self.handle.stop(true).await;
    }
}

async fn completions(
    req: HttpRequest,
    body: web::Json<Value>,
    hits: web::Data<Arc<AtomicUsize>>,
) -> HttpResponse {
    hits.fetch_add(1, Ordering::SeqCst);

    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let model = body["model"].as_str().unwrap_or_default().to_string();

    if model == FAILING_MODEL {
        return HttpResponse::ServiceUnavailable().json(json!({
            "error": {"message": "model overloaded", "code": 503}
        }));
    }

    if body["stream"].as_bool() == Some(true) {
        return HttpResponse::Ok()
            .content_type("text/event-stream")
            .body(STREAM_BODY);
    }

    HttpResponse::Ok().json(json!({
        "id": "cmpl-mock",
        "object": "chat.completion",
        "model": model,
        "echo": {
            "temperature": body["temperature"],
            "max_tokens": body["max_tokens"],
            "messages": body["messages"],
            "authorization": header("authorization"),
            "referer": header("http-referer"),
            "title": header("x-title"),
        },
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello from mock"},
            "finish_reason": "stop"
        }]
    }))
}
