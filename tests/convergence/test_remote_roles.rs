// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Remote evaluator and planner against a local chat completions server

use super::support::{evaluation, Harness};
use image::RgbaImage;
use pii_redactor::convergence::{
    Evaluator, LoopOrchestrator, LoopStatus, Planner, RemoteEvaluator, RemotePlanner,
};
use pii_redactor::redaction::RedactionStyle;
use pii_redactor::remote::{InferenceClient, RemoteErrorKind};
use pii_redactor::session::{ImageStore, KeyStore, API_KEY_NAME};
use pii_redactor::{ConvergenceConfig, RemoteConfig};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn completion(content: &str) -> serde_json::Value {
    json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
}

fn client(server: &MockServer) -> Arc<InferenceClient> {
    Arc::new(InferenceClient::new(&server.uri(), None).unwrap())
}

#[tokio::test]
async fn test_remote_evaluator_parses_fenced_json() {
    let server = MockServer::start().await;
    let content = "```json\n{\"vaguenessScore\": 1.4, \"visibleLeaks\": [{\"type\": \"face\", \"description\": \"Driver\"}], \"reasoning\": \"Face visible\"}\n```";
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("evaluator-model"))
        .and(body_string_contains("data:image/png;base64,"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(content)))
        .expect(1)
        .mount(&server)
        .await;

    let evaluator = RemoteEvaluator::new(client(&server), "evaluator-model");
    let result = evaluator
        .evaluate("sk-test", &RgbaImage::new(16, 16), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.vagueness_score, 1.0);
    assert_eq!(result.visible_leaks.len(), 1);
    assert_eq!(result.visible_leaks[0].kind, "face");
    assert_eq!(result.reasoning, "Face visible");
}

#[tokio::test]
async fn test_remote_evaluator_rejects_missing_score() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("{\"visibleLeaks\": []}")))
        .mount(&server)
        .await;

    let evaluator = RemoteEvaluator::new(client(&server), "evaluator-model");
    let err = evaluator
        .evaluate("sk-test", &RgbaImage::new(4, 4), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind, RemoteErrorKind::Parse);
}

#[tokio::test]
async fn test_remote_planner_output_is_validated() {
    let server = MockServer::start().await;
    let content = json!({
        "redactions": [
            {"style": "blur", "x": -5, "y": 10, "width": 10000, "height": 10, "intensity": 40, "reason": "Name tag"},
            {"style": "sparkles", "x": 20.6, "y": 20.4, "width": 5, "height": 5},
            {"style": "solid", "x": 10, "y": 10, "width": 0, "height": 5}
        ],
        "explanation": "Hide the name tag"
    })
    .to_string();
    Mock::given(method("POST"))
        .and(body_string_contains("planner-model"))
        .and(body_string_contains("100x100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(&content)))
        .expect(1)
        .mount(&server)
        .await;

    let planner = RemotePlanner::new(client(&server), "planner-model");
    let plan = planner
        .plan(
            "sk-test",
            &RgbaImage::new(100, 100),
            &evaluation(0.3, &["text"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(plan.explanation, "Hide the name tag");
    assert_eq!(plan.len(), 3);

    let first = &plan.redactions[0];
    assert_eq!(first.style, RedactionStyle::Blur);
    assert_eq!((first.x, first.y, first.width, first.height), (0, 10, 100, 10));
    assert_eq!(first.intensity, 40);

    let second = &plan.redactions[1];
    assert_eq!(second.style, RedactionStyle::Solid);
    assert_eq!((second.x, second.y), (21, 20));
    assert_eq!(second.intensity, 70);

    let third = &plan.redactions[2];
    assert_eq!((third.width, third.height), (1, 5));

    for redaction in &plan.redactions {
        assert!(redaction.fits_within(100, 100));
    }
}

#[tokio::test]
async fn test_planner_skips_call_when_nothing_leaks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let planner = RemotePlanner::new(client(&server), "planner-model");
    let plan = planner
        .plan(
            "sk-test",
            &RgbaImage::new(10, 10),
            &evaluation(0.5, &[]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(plan.is_empty());
}

#[tokio::test]
async fn test_loop_over_http_clears_key_on_401() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"error": {"message": "No auth credentials found"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(32, 32);
    let remote = RemoteConfig {
        endpoint: server.uri(),
        ..RemoteConfig::default()
    };
    let orchestrator =
        LoopOrchestrator::from_config(&remote, ConvergenceConfig::default(), harness.session())
            .unwrap();

    assert_eq!(orchestrator.start_loop().await.unwrap(), LoopStatus::Error);
    assert!(harness.keys.get(API_KEY_NAME).is_none());
    assert!(orchestrator
        .state()
        .error
        .unwrap()
        .contains("No auth credentials found"));
}

#[tokio::test]
async fn test_loop_over_http_completes() {
    let server = MockServer::start().await;
    let evaluator_reply = json!({
        "vaguenessScore": 0.2,
        "visibleLeaks": [{"type": "text", "description": "Street sign", "region": {"x": 0, "y": 0, "width": 8, "height": 8}}],
        "reasoning": "Readable sign"
    })
    .to_string();
    let planner_reply = json!({
        "redactions": [{"style": "solid", "x": 0, "y": 0, "width": 8, "height": 8, "intensity": 100, "reason": "Street sign"}],
        "explanation": "Cover the sign"
    })
    .to_string();
    let final_reply = json!({"vaguenessScore": 0.92, "visibleLeaks": [], "reasoning": "Nothing left"}).to_string();

    // Planner requests carry the auditor findings; evaluator requests do not
    Mock::given(method("POST"))
        .and(body_string_contains("Auditor findings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(&planner_reply)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(&evaluator_reply)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(&final_reply)))
        .mount(&server)
        .await;

    let harness = Harness::new(32, 32);
    let remote = RemoteConfig {
        endpoint: server.uri(),
        ..RemoteConfig::default()
    };
    let orchestrator =
        LoopOrchestrator::from_config(&remote, ConvergenceConfig::default(), harness.session())
            .unwrap();

    assert_eq!(orchestrator.start_loop().await.unwrap(), LoopStatus::Completed);

    let state = orchestrator.state();
    assert_eq!(state.iterations.len(), 2);
    assert_eq!(state.current_score, Some(0.92));
    assert_eq!(harness.history.len(), 1);
    assert_eq!(
        *harness.images.current().unwrap().get_pixel(4, 4),
        image::Rgba([0, 0, 0, 255])
    );
}
