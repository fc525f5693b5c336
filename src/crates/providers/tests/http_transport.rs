//! HTTP transport tests using a wiremock server.

use bigmodel_providers::framing::LineDecoder;
use bigmodel_providers::{
    AdapterRegistry, GenerationRequest, HttpTransport, ProviderAdapter, ProviderError, TaskType,
    Transport, TransportConfig,
};
use futures::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn read_chunks(
    transport: &HttpTransport,
    adapter: &dyn ProviderAdapter,
    url: &str,
    body: &serde_json::Value,
) -> Vec<bigmodel_providers::Chunk> {
    let mut stream = transport.open(url, body).await.expect("stream should open");
    let mut decoder = LineDecoder::new();
    let mut chunks = Vec::new();
    while let Some(bytes) = stream.next().await {
        for line in decoder.push(&bytes.expect("read should succeed")) {
            chunks.extend(adapter.parse_chunk(&line));
        }
    }
    if let Some(line) = decoder.finish() {
        chunks.extend(adapter.parse_chunk(&line));
    }
    chunks
}

#[tokio::test]
async fn test_glm_stream_over_http() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"reply\": \"Rust \", \"status\": 200, \"finished\": false}\n",
        "data: garbage\n",
        "\n",
        "data: {\"reply\": \"is fast\", \"status\": 200, \"finished\": false}\n",
        "data: {\"reply\": \"\", \"status\": 200, \"finished\": true}\n",
    );

    Mock::given(method("POST"))
        .and(path("/glm"))
        .and(header("x-access-token", "secret"))
        .and(body_partial_json(json!({"inputs": "What is Rust?", "stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let transport =
        HttpTransport::new(TransportConfig::new().with_header("x-access-token", "secret")).unwrap();
    let registry = AdapterRegistry::with_defaults();
    let adapter = registry.get(TaskType::Glm).unwrap();
    let request_body = adapter
        .build_request(&GenerationRequest::new(TaskType::Glm, "What is Rust?"))
        .unwrap();

    let chunks = read_chunks(
        &transport,
        adapter.as_ref(),
        &format!("{}/glm", server.uri()),
        &request_body,
    )
    .await;

    assert_eq!(chunks.len(), 3);
    let text: String = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(text, "Rust is fast");
    assert!(adapter.is_terminal(chunks.last().unwrap()));
}

#[tokio::test]
async fn test_image_stream_yields_links() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"status\": 200, \"progress\": \"step 1/2\"}\n",
        "data: {\"status\": 200, \"pictures\": {\"1\": \"https://img/1.png\"}, \"finished\": true}",
    );

    Mock::given(method("POST"))
        .and(path("/image"))
        .and(body_partial_json(json!({"desc": "a cat", "style": "cartoon"})))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(TransportConfig::default()).unwrap();
    let registry = AdapterRegistry::with_defaults();
    let adapter = registry.get(TaskType::TextToImage).unwrap();
    let request_body = adapter
        .build_request(
            &GenerationRequest::new(TaskType::TextToImage, "a cat").with_style("cartoon"),
        )
        .unwrap();

    let chunks = read_chunks(
        &transport,
        adapter.as_ref(),
        &format!("{}/image", server.uri()),
        &request_body,
    )
    .await;

    assert_eq!(chunks.len(), 2);
    assert!(adapter.is_terminal(&chunks[1]));
    assert_eq!(chunks[1].links["1"], "https://img/1.png");
}

#[tokio::test]
async fn test_error_status_is_reported_before_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("no capacity"))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(TransportConfig::default()).unwrap();
    let result = transport
        .open(&format!("{}/glm", server.uri()), &json!({"inputs": "hi"}))
        .await;

    match result {
        Err(ProviderError::Status { status, body }) => {
            assert_eq!(status, 503);
            assert_eq!(body, "no capacity");
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("expected an error status"),
    }
}
