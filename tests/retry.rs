//! Retry, backoff, rotation and usage accounting of the vision client,
//! driven through a scripted transport on a paused clock.

mod common;

use common::{
    completion, network_error, status, status_with_retry_after, FakeDocument, ScriptedTransport,
};
use edgequake_pdfx::{
    EndpointRotation, ErrorKind, ExtractionConfig, PageExtractor, ProviderConfig, TokenPricing,
    UsageAccumulator, VisionClient,
};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

fn provider() -> ProviderConfig {
    ProviderConfig {
        id: "test".into(),
        name: "Test provider".into(),
        endpoints: vec!["https://a.example/v1/chat/completions".into()],
        model: "vision-test".into(),
        api_key: Some("sk-test".into()),
        max_payload_bytes: 100_000,
        ..ProviderConfig::default()
    }
}

fn client(
    max_retries: u32,
    provider: ProviderConfig,
    document: FakeDocument,
    transport: &Arc<ScriptedTransport>,
) -> VisionClient {
    let config = ExtractionConfig::builder()
        .provider(provider)
        .max_retries(max_retries)
        .build()
        .unwrap();
    VisionClient::from_config(&config, Arc::new(document))
        .unwrap()
        .with_transport(transport.clone())
}

const QUOTA_BODY: &str = r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED","message":"Resource has been exhausted (e.g. check quota)."}}"#;

#[tokio::test(start_paused = true)]
async fn rate_limit_exhausts_the_attempt_budget() {
    let transport = Arc::new(ScriptedTransport::always(status(
        429,
        r#"{"error":{"message":"Too many requests"}}"#,
    )));
    let client = client(2, provider(), FakeDocument::forms(1), &transport);

    let started = Instant::now();
    let failure = client.extract(1).await.unwrap_err();

    assert_eq!(transport.calls(), 4);
    assert_eq!(failure.attempts, 4);
    assert_eq!(failure.error.kind, ErrorKind::RateLimit);
    assert_eq!(failure.error.code, Some(429));
    assert!(failure.error.message.starts_with("HTTP 429"));
    // 2 s + 4 s + 8 s between the four attempts
    assert!(started.elapsed() >= Duration::from_secs(14));
    assert!(started.elapsed() < Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn retry_after_overrides_backoff() {
    let transport = Arc::new(ScriptedTransport::new(
        vec![status_with_retry_after(429, 7)],
        completion("## 1. Done\n### 1.1 Name\nJan"),
    ));
    let client = client(2, provider(), FakeDocument::forms(1), &transport);

    let started = Instant::now();
    let done = client.extract(1).await.unwrap();

    assert_eq!(done.attempts, 2);
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(7));
    assert!(waited < Duration::from_secs(8));
}

#[tokio::test(start_paused = true)]
async fn quota_exhaustion_stops_after_two_retries() {
    let transport = Arc::new(ScriptedTransport::always(status(200, QUOTA_BODY)));
    let client = client(10, provider(), FakeDocument::forms(1), &transport);

    let failure = client.extract(1).await.unwrap_err();

    assert_eq!(transport.calls(), 3);
    assert_eq!(failure.attempts, 3);
    assert_eq!(failure.error.kind, ErrorKind::Payment);
    assert!(failure.error.message.starts_with("quota exhausted:"));
    assert!(failure.error.message.contains("RESOURCE_EXHAUSTED"));
}

#[tokio::test(start_paused = true)]
async fn quota_named_in_a_429_is_a_payment_failure() {
    let transport = Arc::new(ScriptedTransport::always(status(
        429,
        r#"{"error":{"message":"You exceeded your current quota"}}"#,
    )));
    let client = client(10, provider(), FakeDocument::forms(1), &transport);

    let failure = client.extract(1).await.unwrap_err();
    assert_eq!(transport.calls(), 3);
    assert_eq!(failure.error.kind, ErrorKind::Payment);
    assert_eq!(failure.error.code, Some(429));
}

#[tokio::test(start_paused = true)]
async fn per_minute_quota_in_a_429_is_a_rate_limit() {
    let transport = Arc::new(ScriptedTransport::always(status(
        429,
        r#"{"error":{"message":"Quota exceeded for quota metric 'Generate requests' per minute"}}"#,
    )));
    let client = client(2, provider(), FakeDocument::forms(1), &transport);

    let failure = client.extract(1).await.unwrap_err();
    assert_eq!(transport.calls(), 4);
    assert_eq!(failure.error.kind, ErrorKind::RateLimit);
    assert_eq!(failure.error.code, Some(429));
}

#[tokio::test(start_paused = true)]
async fn authentication_failure_is_not_retried() {
    let transport = Arc::new(ScriptedTransport::always(status(
        401,
        r#"{"error":{"message":"No auth credentials found"}}"#,
    )));
    let client = client(5, provider(), FakeDocument::forms(1), &transport);

    let started = Instant::now();
    let failure = client.extract(1).await.unwrap_err();

    assert_eq!(transport.calls(), 1);
    assert_eq!(failure.attempts, 1);
    assert_eq!(failure.error.kind, ErrorKind::Payment);
    assert_eq!(failure.error.code, Some(401));
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn requests_rotate_over_endpoints() {
    let endpoints: Vec<String> = ["a", "b", "c"]
        .iter()
        .map(|r| format!("https://{r}.example/v1/chat/completions"))
        .collect();
    let provider = ProviderConfig {
        endpoints: endpoints.clone(),
        ..provider()
    };
    let transport = Arc::new(ScriptedTransport::new(
        vec![status(500, "upstream error"), status(503, "overloaded")],
        completion("## 1. Rotated"),
    ));
    let rotation = Arc::new(EndpointRotation::starting_at(endpoints.clone(), 1).unwrap());
    let client = client(2, provider, FakeDocument::forms(1), &transport).with_rotation(rotation);

    let done = client.extract(1).await.unwrap();
    assert_eq!(done.attempts, 3);

    let urls: Vec<String> = transport.sent().into_iter().map(|s| s.url).collect();
    assert_eq!(urls, vec![endpoints[1].clone(), endpoints[2].clone(), endpoints[0].clone()]);
}

#[tokio::test(start_paused = true)]
async fn payload_too_large_shrinks_the_image() {
    let transport = Arc::new(ScriptedTransport::new(
        vec![status(413, "Request Entity Too Large")],
        completion("## 1. Smaller"),
    ));
    let client = client(
        2,
        provider(),
        FakeDocument::forms(1).with_noisy_render(),
        &transport,
    );

    let done = client.extract(1).await.unwrap();
    assert_eq!(done.attempts, 2);

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].image_mime, "image/png");
    assert!(sent[0].image_len <= 100_000);
    assert!(sent[0].image_len > 50_000);
    assert_eq!(sent[1].image_mime, "image/jpeg");
    assert!(sent[1].image_len < sent[0].image_len);
}

#[tokio::test(start_paused = true)]
async fn network_error_is_retried() {
    let transport = Arc::new(ScriptedTransport::new(
        vec![network_error("connection reset by peer")],
        completion("```markdown\n## 1. Recovered\n```"),
    ));
    let client = client(2, provider(), FakeDocument::forms(1), &transport);

    let started = Instant::now();
    let done = client.extract(1).await.unwrap();

    assert_eq!(done.attempts, 2);
    assert_eq!(done.content, "## 1. Recovered");
    assert!(started.elapsed() >= Duration::from_secs(2));
    let sent = transport.sent();
    assert!(sent.iter().all(|s| s.model == "vision-test"));
}

#[tokio::test(start_paused = true)]
async fn network_error_exhausts_the_attempt_budget() {
    let transport = Arc::new(ScriptedTransport::always(network_error("connection refused")));
    let client = client(1, provider(), FakeDocument::forms(1), &transport);

    let started = Instant::now();
    let failure = client.extract(1).await.unwrap_err();

    assert_eq!(transport.calls(), 3);
    assert_eq!(failure.attempts, 3);
    assert_eq!(failure.error.kind, ErrorKind::Network);
    assert_eq!(failure.error.code, None);
    assert!(failure.error.message.contains("connection refused"));
    // 2 s + 4 s
    assert!(started.elapsed() >= Duration::from_secs(6));
    assert!(started.elapsed() < Duration::from_secs(7));
}

#[tokio::test(start_paused = true)]
async fn malformed_body_is_a_model_response_failure() {
    let transport = Arc::new(ScriptedTransport::always(status(200, r#"{"choices":[]}"#)));
    let client = client(0, provider(), FakeDocument::forms(1), &transport);

    let failure = client.extract(1).await.unwrap_err();
    assert_eq!(failure.attempts, 2);
    assert_eq!(failure.error.kind, ErrorKind::ModelResponse);
}

#[tokio::test(start_paused = true)]
async fn usage_prefers_reported_cost() {
    let body = serde_json::json!({
        "choices": [{ "message": { "content": "## 1. Paid" } }],
        "usage": { "prompt_tokens": 1500, "completion_tokens": 250, "cost": 0.0042 }
    });
    let transport = Arc::new(ScriptedTransport::always(status(200, &body.to_string())));
    let client = client(2, provider(), FakeDocument::forms(1), &transport);

    let done = client.extract(1).await.unwrap();
    assert_eq!(done.usage, UsageAccumulator::new(1500, 250, 0.0042));
}

#[tokio::test(start_paused = true)]
async fn usage_falls_back_to_pricing() {
    let provider = ProviderConfig {
        pricing: TokenPricing {
            input_per_million: 1.0,
            output_per_million: 4.0,
            image_tokens_estimate: 1000,
        },
        ..provider()
    };
    let transport = Arc::new(ScriptedTransport::always(completion("## 1. Priced")));
    let client = client(2, provider, FakeDocument::forms(1), &transport);

    let done = client.extract(1).await.unwrap();
    // 1200 in, 300 out: 0.0012 + 0.0012
    assert_eq!(done.usage.input_tokens, 1200);
    assert_eq!(done.usage.output_tokens, 300);
    assert_eq!(done.usage.cost_nanos, 2_400_000);
}
