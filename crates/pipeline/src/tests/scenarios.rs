//! End-to-end runs of the pipeline against fake sources.

use super::*;
use crate::postprocess::PostProcessor;
use crate::types::{AssembledContext, GeneratedText, ResponsePackage, DEGRADED_QUALITY_SCORE};
use crate::Analysis;
use sift_llm::{LlmCapabilities, ScriptedClient};
use std::time::Duration;

const ANSWER: &str = "## Comparison\n\nThe **Zephyr X1** is lighter than the Nimbus 7.";

fn complete_package(events: &[PipelineEvent]) -> &ResponsePackage {
    match events.last() {
        Some(PipelineEvent::Complete { data, .. }) => data,
        other => panic!("expected complete, got {:?}", other),
    }
}

fn phase_result(events: &[PipelineEvent], wanted: u8) -> &serde_json::Value {
    events
        .iter()
        .find_map(|e| match e {
            PipelineEvent::PhaseResult { phase, data, .. } if *phase == wanted => Some(data),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no phase_result for phase {}", wanted))
}

#[tokio::test]
async fn test_compare_with_structured_only_evidence_completes() {
    let semantic = Arc::new(FakeSemantic::new(Vec::new()));
    let pipeline = build_pipeline(
        semantic,
        catalog(),
        Arc::new(ScriptedClient::new(ANSWER)),
        fresh_cache(),
    );

    let (events, outcome) =
        run_collect(pipeline, PipelineRequest::new("compare Zephyr X1 and Nimbus 7")).await;

    assert_well_formed(&events);
    let package = complete_package(&events);
    assert_eq!(package.metadata["source_counts"]["semantic"], 0);
    assert_eq!(package.metadata["source_counts"]["structured"], 2);
    assert_eq!(package.metadata["intent"], "compare");
    assert_eq!(package.citations.len(), 2);
    assert_eq!(package.text, ANSWER);
    assert!(matches!(outcome, PipelineOutcome::Completed(_)));

    let analysis = phase_result(&events, 1);
    assert_eq!(analysis["entities"], serde_json::json!(["Zephyr X1", "Nimbus 7"]));
}

#[tokio::test]
async fn test_no_data_from_any_source_is_phase_two_error() {
    let semantic = Arc::new(FakeSemantic::new(Vec::new()));
    let pipeline = build_pipeline(
        semantic,
        Vec::new(),
        Arc::new(ScriptedClient::new(ANSWER)),
        fresh_cache(),
    );

    let (events, outcome) = run_collect(pipeline, PipelineRequest::new("tell me anything")).await;

    assert_well_formed(&events);
    match events.last().unwrap() {
        PipelineEvent::Error {
            message,
            phase,
            partial,
            phase_timings,
        } => {
            assert_eq!(*phase, Some(2));
            assert!(message.contains("no data"));
            assert!(*partial);
            assert!(phase_timings.contains_key(&1));
            assert!(phase_timings.contains_key(&2));
            assert!(!phase_timings.contains_key(&3));
        }
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(
        outcome,
        PipelineOutcome::Failed {
            phase: Some(2),
            message: "phase2 failed: no data".to_string()
        }
    );
    assert!(!events.iter().any(|e| matches!(e, PipelineEvent::Token { .. })));
}

#[tokio::test]
async fn test_blocking_only_client_still_streams_tokens() {
    let client = ScriptedClient::new(ANSWER).with_capabilities(LlmCapabilities {
        streaming: false,
        completion: false,
        blocking: true,
    });
    let semantic = Arc::new(FakeSemantic::new(vec![product_match("m1", "Zephyr X1", 0.8)]));
    let pipeline = build_pipeline(semantic, catalog(), Arc::new(client), fresh_cache());

    let (events, _) =
        run_collect(pipeline, PipelineRequest::new("compare Zephyr X1 and Nimbus 7")).await;

    assert_well_formed(&events);
    let tokens = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::Token { .. }))
        .count();
    assert!(tokens > 1, "answer should be re-chunked into several tokens");

    let package = complete_package(&events);
    assert_eq!(package.text, token_text(&events));
    assert_eq!(package.metadata["generation_strategy"], "blocking_relay");
}

#[tokio::test]
async fn test_thousand_candidates_with_tiny_budget() {
    let matches: Vec<Match> = (0..1000)
        .map(|i| product_match(&format!("m{}", i), &format!("Model {}", i), 1.0 - i as f32 / 2000.0))
        .collect();
    let semantic = Arc::new(FakeSemantic::new(matches));
    let pipeline = build_pipeline(
        semantic,
        Vec::new(),
        Arc::new(ScriptedClient::new(ANSWER)),
        fresh_cache(),
    );

    let request = PipelineRequest::new("laptops").with_token_budget(5);
    let (events, _) = run_collect(pipeline, request).await;

    assert_well_formed(&events);
    let assembled = phase_result(&events, 3);
    assert_eq!(assembled["truncated"], true);
    assert_eq!(assembled["original_count"], 1000);
    assert!(assembled["items"].as_u64().unwrap() >= 1);
    assert!(assembled["estimated_tokens"].as_u64().unwrap() <= 5);

    let package = complete_package(&events);
    assert_eq!(package.metadata["truncated"], true);
    assert!(!package.citations.is_empty());
}

#[tokio::test]
async fn test_empty_query_is_rejected_before_phase_one() {
    let pipeline = build_pipeline(
        Arc::new(FakeSemantic::new(Vec::new())),
        catalog(),
        Arc::new(ScriptedClient::new(ANSWER)),
        fresh_cache(),
    );

    let (events, _) = run_collect(pipeline, PipelineRequest::new("   ")).await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        PipelineEvent::Error {
            phase,
            phase_timings,
            ..
        } => {
            assert_eq!(*phase, None);
            assert!(phase_timings.is_empty());
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_one_failed_source_is_a_warning() {
    let mut semantic = FakeSemantic::new(Vec::new());
    semantic.fail = true;
    let pipeline = build_pipeline(
        Arc::new(semantic),
        catalog(),
        Arc::new(ScriptedClient::new(ANSWER)),
        fresh_cache(),
    );

    let (events, _) =
        run_collect(pipeline, PipelineRequest::new("compare Zephyr X1 and Nimbus 7")).await;

    let package = complete_package(&events);
    assert!(package
        .quality
        .warnings
        .iter()
        .any(|w| w.contains("semantic source unavailable")));
}

#[tokio::test]
async fn test_panicking_adapter_degrades_to_other_source() {
    let mut semantic = FakeSemantic::new(Vec::new());
    semantic.panic = true;
    let pipeline = build_pipeline(
        Arc::new(semantic),
        catalog(),
        Arc::new(ScriptedClient::new(ANSWER)),
        fresh_cache(),
    );

    let (events, outcome) =
        run_collect(pipeline, PipelineRequest::new("compare Zephyr X1 and Nimbus 7")).await;

    assert_well_formed(&events);
    let package = match outcome {
        PipelineOutcome::Completed(package) => package,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(package.citations.len(), 2);
    assert!(package
        .quality
        .warnings
        .iter()
        .any(|w| w.contains("semantic source unavailable")));
}

#[tokio::test]
async fn test_failed_generation_degrades_instead_of_erroring() {
    let pipeline = build_pipeline(
        Arc::new(FakeSemantic::new(Vec::new())),
        catalog(),
        Arc::new(ScriptedClient::new(ANSWER).failing("model offline")),
        fresh_cache(),
    );

    let (events, _) =
        run_collect(pipeline, PipelineRequest::new("compare Zephyr X1 and Nimbus 7")).await;

    assert_well_formed(&events);
    let package = complete_package(&events);
    assert_eq!(package.text, "");
    assert!(package.quality.score < 1.0);
    assert!(package
        .quality
        .warnings
        .iter()
        .any(|w| w.starts_with("generation degraded") && w.contains("model offline")));
}

struct PanickingPostProcessor;

impl PostProcessor for PanickingPostProcessor {
    fn process(
        &self,
        _generated: &GeneratedText,
        _context: &AssembledContext,
        _analysis: &Analysis,
        _query: &str,
        _upstream_warnings: &[String],
    ) -> ResponsePackage {
        panic!("post-processor bug");
    }
}

#[tokio::test]
async fn test_postprocess_panic_returns_raw_text() {
    let pipeline = Arc::new(
        Pipeline::builder()
            .semantic(Arc::new(FakeSemantic::new(Vec::new())))
            .structured(Arc::new(FakeStructured { rows: catalog() }))
            .client(Arc::new(ScriptedClient::new("raw **unclosed")))
            .config(test_config())
            .postprocessor(Arc::new(PanickingPostProcessor))
            .build()
            .unwrap(),
    );

    let (events, _) =
        run_collect(pipeline, PipelineRequest::new("compare Zephyr X1 and Nimbus 7")).await;

    let package = complete_package(&events);
    assert_eq!(package.text, "raw **unclosed");
    assert_eq!(package.quality.score, DEGRADED_QUALITY_SCORE);
    assert!(package.metadata.contains_key("phase_timings"));
}

#[tokio::test]
async fn test_repeat_request_is_served_from_cache() {
    let client = ScriptedClient::new(ANSWER);
    let semantic = Arc::new(FakeSemantic::new(vec![product_match("m1", "Zephyr X1", 0.9)]));
    let pipeline = build_pipeline(
        semantic.clone(),
        catalog(),
        Arc::new(client.clone()),
        fresh_cache(),
    );

    let query = "compare Zephyr X1 and Nimbus 7";
    let (first, _) = run_collect(pipeline.clone(), PipelineRequest::new(query)).await;
    let (second, _) = run_collect(pipeline, PipelineRequest::new(query)).await;

    assert_eq!(token_text(&first), token_text(&second));
    assert_eq!(phase_result(&second, 1)["from_cache"], true);
    assert_eq!(phase_result(&second, 2)["from_cache"], true);
    assert_eq!(complete_package(&second).metadata["from_cache"], true);
    assert_eq!(semantic.calls(), 1);
    assert_eq!(client.calls(), 1);
}

#[tokio::test]
async fn test_consumer_disconnect_cancels_generation() {
    let client = ScriptedClient::new("x".repeat(2000))
        .with_chunk_chars(1)
        .with_latency(Duration::from_millis(1));
    let pipeline = build_pipeline(
        Arc::new(FakeSemantic::new(Vec::new())),
        catalog(),
        Arc::new(client),
        fresh_cache(),
    );

    let (mut rx, handle) = pipeline.spawn(PipelineRequest::new("compare Zephyr X1 and Nimbus 7"));
    loop {
        match rx.recv().await {
            Some(PipelineEvent::Token { .. }) => break,
            Some(_) => continue,
            None => panic!("stream ended before any token"),
        }
    }
    drop(rx);

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("pipeline should stop promptly")
        .unwrap();
    assert_eq!(outcome, PipelineOutcome::Cancelled);
}
