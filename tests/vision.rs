//! Vision query integration tests against a mock chat completions server

use beacon_lens::camera::ImageBytes;
use beacon_lens::vision::VisionSettings;
use beacon_lens::{QueryError, VisionQuery, VisionQueryService};
use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;

fn service_for(server: &MockServer) -> VisionQueryService {
    VisionQueryService::new(
        Some(SecretString::from("sk-test")),
        VisionSettings {
            endpoint: format!("{}/v1/chat/completions", server.uri()),
            ..VisionSettings::default()
        },
    )
}

fn jpeg() -> ImageBytes {
    ImageBytes {
        data: common::tiny_jpeg(),
        mime_type: "image/jpeg",
    }
}

#[tokio::test]
async fn test_answer_is_returned_trimmed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "  A red mug on a desk.  " } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let answer = service_for(&server)
        .query(&jpeg(), "What is on the table?")
        .await
        .unwrap();
    assert_eq!(answer, "A red mug on a desk.");
}

#[tokio::test]
async fn test_request_carries_question_image_and_detail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Question: What color is the door?"))
        .and(body_string_contains("data:image/jpeg;base64,"))
        .and(body_string_contains(r#""detail":"low""#))
        .and(body_string_contains(r#""max_tokens":300"#))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "Blue." } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let answer = service_for(&server)
        .query(&jpeg(), "What color is the door?")
        .await
        .unwrap();
    assert_eq!(answer, "Blue.");
}

#[tokio::test]
async fn test_error_status_uses_api_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "message": "Rate limit reached", "type": "requests" }
        })))
        .mount(&server)
        .await;

    let err = service_for(&server)
        .query(&jpeg(), "What is this?")
        .await
        .unwrap_err();

    match &err {
        QueryError::Transport(detail) => {
            assert!(detail.contains("429"), "{detail}");
            assert!(detail.contains("Rate limit reached"), "{detail}");
        }
        other => panic!("expected transport error, got {other:?}"),
    }
    assert_eq!(
        err.user_message(),
        "Sorry, I couldn't analyze the image. Please try again."
    );
}

#[tokio::test]
async fn test_error_status_with_plain_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let err = service_for(&server)
        .query(&jpeg(), "What is this?")
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Transport(ref d) if d.contains("bad gateway")));
}

#[tokio::test]
async fn test_missing_content_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let err = service_for(&server)
        .query(&jpeg(), "What is this?")
        .await
        .unwrap_err();
    assert_eq!(err, QueryError::MalformedResponse);
}

#[tokio::test]
async fn test_non_json_success_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let err = service_for(&server)
        .query(&jpeg(), "What is this?")
        .await
        .unwrap_err();
    assert_eq!(err, QueryError::MalformedResponse);
}

#[tokio::test]
async fn test_unreachable_endpoint_is_transport() {
    let service = VisionQueryService::new(
        Some(SecretString::from("sk-test")),
        VisionSettings {
            endpoint: "http://127.0.0.1:9/v1/chat/completions".to_string(),
            ..VisionSettings::default()
        },
    );

    let err = service.query(&jpeg(), "What is this?").await.unwrap_err();
    assert!(matches!(err, QueryError::Transport(_)));
}
