use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Router,
    extract::{Json, Path, State},
    http::{HeaderMap, StatusCode, Uri},
    response::sse::Event,
    response::{IntoResponse, Response, Sse},
    routing::post,
};
use futures::stream::{self, StreamExt, TryStreamExt};
use gemchat_agents::providers::{GeminiProvider, StreamClient};
use gemchat_common::{Error, Message, MessageStatus, Result};
use gemchat_security::{CredentialLookup, StaticCredential};
use serde_json::{Value, json};
use tokio::sync::oneshot;

#[derive(Debug, Clone)]
struct Recorded {
    api_key: Option<String>,
    query: Option<String>,
    body: Value,
}

#[derive(Default)]
struct MockState {
    requests: Mutex<Vec<Recorded>>,
}

impl MockState {
    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

async fn start_mock_server() -> (SocketAddr, Arc<MockState>, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let state = Arc::new(MockState::default());

    let app = Router::new()
        .route("/v1beta/models/{*method}", post(mock_generate))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                rx.await.ok();
            })
            .await
            .unwrap();
    });

    (addr, state, tx)
}

fn chunk(text: &str) -> Value {
    json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "index": 0
        }]
    })
}

fn sse(payloads: Vec<Value>) -> Response {
    let events = payloads
        .into_iter()
        .map(|p| Ok::<_, Infallible>(Event::default().data(p.to_string())));
    Sse::new(stream::iter(events)).into_response()
}

async fn mock_generate(
    State(state): State<Arc<MockState>>,
    Path(method): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.requests.lock().unwrap().push(Recorded {
        api_key: headers
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        query: uri.query().map(str::to_string),
        body,
    });

    let model = method.split(':').next().unwrap_or_default();
    match model {
        "ok" => sse(vec![
            chunk("Hel"),
            json!({"candidates": [{"finishReason": "STOP"}]}),
            chunk("lo"),
            chunk(", world"),
        ]),
        "bad-key-body" => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": {
                    "code": 400,
                    "message": "API key not valid. Please pass a valid API key.",
                    "status": "INVALID_ARGUMENT"
                }
            })),
        )
            .into_response(),
        "unauthorized" => (StatusCode::UNAUTHORIZED, "unauthorized").into_response(),
        "broken" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": {"code": 500, "message": "Internal error encountered."}})),
        )
            .into_response(),
        "in-band" => sse(vec![
            chunk("Par"),
            json!({"error": {"code": 503, "message": "The model is overloaded."}}),
        ]),
        "malformed" => {
            let events = [
                Event::default().data(chunk("Hel").to_string()),
                Event::default().data(r#"{"candidates":[{"content":{"parts":[{"text":"lo"#),
            ]
            .map(Ok::<_, Infallible>);
            Sse::new(stream::iter(events)).into_response()
        }
        _ => (StatusCode::NOT_FOUND, "unknown model").into_response(),
    }
}

fn provider(addr: SocketAddr, model: &str) -> GeminiProvider {
    GeminiProvider::new(model, Arc::new(StaticCredential::new("test-key")))
        .with_base_url(format!("http://{addr}/v1beta"))
}

async fn collect(
    provider: &GeminiProvider,
    message: &str,
    history: &[Message],
) -> Result<Vec<String>> {
    provider
        .open_stream(message, "Be helpful.", history)
        .await?
        .try_collect()
        .await
}

#[tokio::test]
async fn test_gemini_streams_fragments() -> Result<()> {
    let (addr, state, _shutdown_tx) = start_mock_server().await;

    let fragments = collect(&provider(addr, "ok"), "Hi", &[]).await?;
    assert_eq!(fragments, vec!["Hel", "lo", ", world"]);

    let requests = state.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].api_key.as_deref(), Some("test-key"));
    assert_eq!(requests[0].query.as_deref(), Some("alt=sse"));
    assert_eq!(
        requests[0].body["systemInstruction"]["parts"][0]["text"],
        "Be helpful."
    );
    assert_eq!(requests[0].body["contents"][0]["parts"][0]["text"], "Hi");
    Ok(())
}

#[tokio::test]
async fn test_gemini_history_skips_in_flight_messages() -> Result<()> {
    let (addr, state, _shutdown_tx) = start_mock_server().await;

    let mut answer = Message::placeholder();
    answer.content = "Four".to_string();
    answer.status = MessageStatus::Settled;
    let mut half = Message::placeholder();
    half.content = "Tr".to_string();
    half.status = MessageStatus::Streaming;
    let history = vec![Message::user("2 + 2?"), answer, half];

    collect(&provider(addr, "ok"), "And 3 + 3?", &history).await?;

    let contents = state.requests()[0].body["contents"].clone();
    let turns: Vec<(&str, &str)> = contents
        .as_array()
        .unwrap()
        .iter()
        .map(|c| {
            (
                c["role"].as_str().unwrap(),
                c["parts"][0]["text"].as_str().unwrap(),
            )
        })
        .collect();
    assert_eq!(
        turns,
        vec![("user", "2 + 2?"), ("model", "Four"), ("user", "And 3 + 3?")]
    );
    Ok(())
}

#[tokio::test]
async fn test_gemini_invalid_key_body_is_auth_error() {
    let (addr, _state, _shutdown_tx) = start_mock_server().await;

    let result = provider(addr, "bad-key-body").open_stream("Hi", "", &[]).await;
    assert!(matches!(result, Err(Error::Auth(_))));
}

#[tokio::test]
async fn test_gemini_unauthorized_status_is_auth_error() {
    let (addr, _state, _shutdown_tx) = start_mock_server().await;

    let result = provider(addr, "unauthorized").open_stream("Hi", "", &[]).await;
    assert!(matches!(result, Err(Error::Auth(_))));
}

#[tokio::test]
async fn test_gemini_server_error_is_stream_error() {
    let (addr, _state, _shutdown_tx) = start_mock_server().await;

    let result = provider(addr, "broken").open_stream("Hi", "", &[]).await;
    match result {
        Err(Error::Stream(msg)) => assert!(msg.contains("Internal error encountered")),
        Err(other) => panic!("expected stream error, got {other}"),
        Ok(_) => panic!("expected stream error"),
    }
}

#[tokio::test]
async fn test_gemini_in_band_error_ends_stream() -> Result<()> {
    let (addr, _state, _shutdown_tx) = start_mock_server().await;

    let mut stream = provider(addr, "in-band").open_stream("Hi", "", &[]).await?;
    assert_eq!(stream.next().await.unwrap()?, "Par");
    let err = stream.next().await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Stream(_)));
    Ok(())
}

#[tokio::test]
async fn test_gemini_malformed_chunk_fails_the_stream() -> Result<()> {
    let (addr, _state, _shutdown_tx) = start_mock_server().await;

    let mut stream = provider(addr, "malformed").open_stream("Hi", "", &[]).await?;
    assert_eq!(stream.next().await.unwrap()?, "Hel");
    let err = stream.next().await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Stream(_)));
    Ok(())
}

#[tokio::test]
async fn test_gemini_looks_up_credential_per_request() -> Result<()> {
    let (addr, state, _shutdown_tx) = start_mock_server().await;

    let lookups = Arc::new(AtomicUsize::new(0));
    let counter = lookups.clone();
    let credentials: Arc<dyn CredentialLookup> = Arc::new(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        Some(format!("key-{n}"))
    });
    let provider =
        GeminiProvider::new("ok", credentials).with_base_url(format!("http://{addr}/v1beta"));

    collect(&provider, "one", &[]).await?;
    collect(&provider, "two", &[]).await?;

    assert_eq!(lookups.load(Ordering::SeqCst), 2);
    let keys: Vec<Option<String>> = state.requests().into_iter().map(|r| r.api_key).collect();
    assert_eq!(keys, vec![Some("key-0".to_string()), Some("key-1".to_string())]);
    Ok(())
}

#[tokio::test]
async fn test_gemini_missing_key_fails_before_request() {
    let (addr, state, _shutdown_tx) = start_mock_server().await;

    let provider = GeminiProvider::new("ok", Arc::new(StaticCredential::missing()))
        .with_base_url(format!("http://{addr}/v1beta"));

    let result = provider.open_stream("Hi", "", &[]).await;
    assert!(matches!(result, Err(Error::Auth(_))));
    assert!(state.requests().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn test_gemini_credential_lookup_leaves_runtime_free() -> Result<()> {
    let (addr, state, _shutdown_tx) = start_mock_server().await;

    // The key only arrives from a task on this runtime, so a lookup that
    // blocked the runtime thread would time out and find nothing.
    let (key_tx, key_rx) = std::sync::mpsc::channel::<String>();
    let key_rx = Mutex::new(key_rx);
    let credentials: Arc<dyn CredentialLookup> = Arc::new(move || {
        key_rx
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(5))
            .ok()
    });
    tokio::spawn(async move {
        let _ = key_tx.send("slow-key".to_string());
    });

    let provider =
        GeminiProvider::new("ok", credentials).with_base_url(format!("http://{addr}/v1beta"));
    collect(&provider, "Hi", &[]).await?;

    assert_eq!(state.requests()[0].api_key.as_deref(), Some("slow-key"));
    Ok(())
}
