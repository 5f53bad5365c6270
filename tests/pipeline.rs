//! End-to-end telemetry plane tests: hook emission → span enrichment →
//! batch export → gzipped JSONL on disk, plus the heartbeat loop.

use std::io::BufRead as _;
use std::path::Path;
use std::time::Duration;

use flate2::read::MultiGzDecoder;
use inspector::config::InspectorConfig;
use inspector::events::Event;
use inspector::instrument::{self, hooks, HookPayload, LifecyclePayload, TokenUsage};
use inspector::sessions::Engine;
use inspector::span_meta;
use inspector::{context, InspectorContext};
use tempfile::TempDir;

fn read_spans(path: &Path) -> Vec<serde_json::Value> {
    let file = std::fs::File::open(path).unwrap();
    std::io::BufReader::new(MultiGzDecoder::new(file))
        .lines()
        .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
        .collect()
}

#[tokio::test]
async fn oversized_prompt_is_truncated_on_disk() {
    let dir = TempDir::new().unwrap();
    let config = InspectorConfig::new(None, Some(dir.path().to_path_buf()), None);
    let ctx = InspectorContext::new(config).unwrap();

    let big_prompt = "p".repeat(40 * 1024);
    context::scope("sess-trunc1", async {
        ctx.tracer
            .in_span("llm.generate", async {
                instrument::emit(
                    hooks::BEFORE_LLM_GENERATE,
                    &HookPayload::LlmGenerate {
                        provider: Some("anthropic".to_string()),
                        model: Some("claude-sonnet-4".to_string()),
                        prompt: Some(serde_json::json!(big_prompt)),
                        response: None,
                        usage: None,
                        error: None,
                        extra: serde_json::Map::new(),
                    },
                )
                .await;
            })
            .await;
    })
    .await;

    ctx.shutdown().await;

    let spans = read_spans(&dir.path().join("sess-trunc1.jsonl.gz"));
    assert_eq!(spans.len(), 1);
    let attrs = &spans[0]["attributes"];

    let stored = attrs[span_meta::LLM_PROMPT_JSON].as_str().unwrap();
    assert_eq!(stored.len(), span_meta::MAX_ATTRIBUTE_SIZE);
    assert_eq!(
        attrs[format!("{}_truncated", span_meta::LLM_PROMPT_JSON)],
        true
    );
    assert_eq!(attrs[span_meta::SESSION_ID], "sess-trunc1");
    assert_eq!(attrs[span_meta::LLM_MODEL], "claude-sonnet-4");
}

#[tokio::test]
async fn concurrent_sessions_write_separate_files_in_order() {
    let dir = TempDir::new().unwrap();
    let config = InspectorConfig::new(None, Some(dir.path().to_path_buf()), None);
    let ctx = InspectorContext::new(config).unwrap();

    let mut tasks = Vec::new();
    for session in ["sess-par001", "sess-par002"] {
        let tracer = ctx.tracer.clone();
        tasks.push(tokio::spawn(context::scope(
            session.to_string(),
            async move {
                for i in 0..5 {
                    tracer.in_span(&format!("op-{i}"), async {}).await;
                }
            },
        )));
    }
    for task in tasks {
        task.await.unwrap();
    }

    ctx.shutdown().await;

    for session in ["sess-par001", "sess-par002"] {
        let spans = read_spans(&dir.path().join(format!("{session}.jsonl.gz")));
        assert_eq!(spans.len(), 5, "{session}");
        let names: Vec<&str> = spans.iter().map(|s| s["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["op-0", "op-1", "op-2", "op-3", "op-4"]);
        for span in &spans {
            assert_eq!(span["attributes"][span_meta::SESSION_ID], session);
        }
    }
}

#[tokio::test]
async fn heartbeat_loop_publishes_counter_deltas() {
    let dir = TempDir::new().unwrap();
    let mut config = InspectorConfig::new(None, Some(dir.path().to_path_buf()), None);
    config.heartbeat_interval = Duration::from_millis(50);
    let ctx = InspectorContext::new(config).unwrap();

    let _handle = ctx
        .registry
        .register_workflow("sess-hb0001", Engine::Local, None);
    let mut sub = ctx.events.subscribe(None);

    context::scope("sess-hb0001", async {
        instrument::emit(
            hooks::SESSION_STARTED,
            &HookPayload::Lifecycle(LifecyclePayload {
                session_id: "sess-hb0001".to_string(),
                engine: Some(Engine::Local),
                ..Default::default()
            }),
        )
        .await;

        // One LLM round-trip the counters should pick up.
        instrument::emit(
            hooks::AFTER_LLM_GENERATE,
            &HookPayload::LlmGenerate {
                provider: None,
                model: None,
                prompt: None,
                response: None,
                usage: Some(TokenUsage {
                    input_tokens: 100,
                    output_tokens: 25,
                }),
                error: None,
                extra: serde_json::Map::new(),
            },
        )
        .await;
    })
    .await;

    // First event is SessionStarted, then heartbeats tick in.
    let first = tokio::time::timeout(Duration::from_secs(2), sub.rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first.event, Event::SessionStarted { .. }));

    let heartbeat = loop {
        let envelope = tokio::time::timeout(Duration::from_secs(2), sub.rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let Event::Heartbeat {
            llm_calls_delta,
            tokens_delta,
            ..
        } = envelope.event
        {
            if llm_calls_delta > 0 {
                break (llm_calls_delta, tokens_delta);
            }
        }
    };
    assert_eq!(heartbeat, (1, 125));

    // After the session finishes the loop stops on its own.
    instrument::emit(
        hooks::SESSION_FINISHED,
        &HookPayload::Lifecycle(LifecyclePayload {
            session_id: "sess-hb0001".to_string(),
            ..Default::default()
        }),
    )
    .await;
    assert!(!ctx.registry.is_active("sess-hb0001"));
}
