//! End-to-end tests for the streaming chat route.

mod helpers;

use helpers::{CHAT_KEY, MockDownstream, TestGateway, test_config};
use reqwest::StatusCode;
use serde_json::{Value, json};

/// Parse an SSE body into the JSON payload of each `data:` line.
fn data_frames(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

fn stream_body() -> Value {
    json!({
        "messages": [{ "role": "user", "content": "Tell me a story" }],
        "user_id": "alice",
        "session_id": "s-42"
    })
}

#[tokio::test]
async fn test_stream_tokens_arrive_in_order() {
    let mock = MockDownstream::new().with_tokens(&["A", "B"]).start().await;
    let gateway = TestGateway::start(test_config(&mock.url(), 5)).await;

    let response = gateway
        .post("/v1/chat/stream", Some(CHAT_KEY), &stream_body())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let frames = data_frames(&response.text().await.unwrap());
    assert_eq!(
        frames,
        vec![
            json!({ "token": "A" }),
            json!({ "token": "B" }),
            json!({ "done": true }),
        ]
    );

    let forwarded = &mock.bodies()[0];
    assert_eq!(forwarded["stream"], true);
    assert_eq!(forwarded["session_id"], "s-42");
}

#[tokio::test]
async fn test_stream_via_get_query() {
    let mock = MockDownstream::new().with_tokens(&["hi"]).start().await;
    let gateway = TestGateway::start(test_config(&mock.url(), 5)).await;

    let response = gateway
        .client
        .get(gateway.url("/v1/chat/stream"))
        .query(&[("message", "hello"), ("user_id", "alice")])
        .bearer_auth(CHAT_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let frames = data_frames(&response.text().await.unwrap());
    assert_eq!(frames.first(), Some(&json!({ "token": "hi" })));
    assert_eq!(frames.last(), Some(&json!({ "done": true })));
    assert_eq!(mock.bodies()[0]["message"], "hello");
}

#[tokio::test]
async fn test_truncated_stream_ends_with_error_frame() {
    let mock = MockDownstream::new().with_tokens(&["A"]).truncated().start().await;
    let gateway = TestGateway::start(test_config(&mock.url(), 5)).await;

    let response = gateway
        .post("/v1/chat/stream", Some(CHAT_KEY), &stream_body())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let trace_id = response.headers()["x-request-id"].to_str().unwrap().to_string();

    let frames = data_frames(&response.text().await.unwrap());
    assert_eq!(frames[0], json!({ "token": "A" }));
    let last = frames.last().unwrap();
    assert_eq!(last["error"]["code"], "STREAM_ERROR");
    assert_eq!(last["error"]["trace_id"], trace_id.as_str());
    assert!(!frames.iter().any(|f| f.get("done").is_some()));
}

#[tokio::test]
async fn test_stream_rejected_before_opening_is_json() {
    let mock = MockDownstream::new().start().await;
    let gateway = TestGateway::start(test_config(&mock.url(), 5)).await;

    let response = gateway.post("/v1/chat/stream", None, &stream_body()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "UNAUTHENTICATED");
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn test_malformed_query_is_401_before_400() {
    let mock = MockDownstream::new().start().await;
    let gateway = TestGateway::start(test_config(&mock.url(), 5)).await;
    let url = gateway.url("/v1/chat/stream?user_id=alice");

    let response = gateway.client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "UNAUTHENTICATED");

    let response = gateway
        .client
        .get(&url)
        .bearer_auth(CHAT_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert_eq!(mock.calls(), 0);
}
