//! Integration tests for payload suppression and subscriber delivery

mod common;

use common::{
    uniform_handlers, CountingHandler, RecordingTransport, RejectingPersistence,
    ScriptedClassifier, Step,
};
use envoy_engine::config::GraphConfig;
use envoy_engine::db::{InMemoryPersistence, Persistence};
use envoy_engine::graph::{GraphEngine, NodeTag};
use envoy_engine::stream::{
    self, ChannelTransport, ConnectionRegistry, PayloadFilter, StreamMultiplexer,
};
use proptest::prelude::*;
use sdk::errors::EngineError;
use sdk::types::{ClientMessage, MessageStatus, Turn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Split `text` into fragments at the given char offsets
fn fragments(text: &str, cuts: &[usize]) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (chars.len() + 1)).collect();
    points.push(0);
    points.push(chars.len());
    points.sort_unstable();
    points.dedup();

    points
        .windows(2)
        .map(|w| chars[w[0]..w[1]].iter().collect())
        .collect()
}

fn filtered(fragments: &[String]) -> String {
    let mut filter = PayloadFilter::new();
    let mut out = String::new();
    for fragment in fragments {
        if let Some(visible) = filter.push(fragment) {
            out.push_str(&visible);
        }
    }
    if let Some(rest) = filter.finish() {
        out.push_str(&rest);
    }
    out
}

proptest! {
    #[test]
    fn test_fenced_payload_is_removed(
        prefix in "[a-zA-Z .,!?\n]{0,30}",
        body in "[a-z\":, \n{}]{0,30}",
        suffix in "[a-zA-Z .,!?]{0,30}",
        cuts in prop::collection::vec(0usize..200, 0..8),
    ) {
        let input = format!("{}```json\n{}\n```{}", prefix, body, suffix);
        let out = filtered(&fragments(&input, &cuts));
        prop_assert_eq!(out, format!("{}{}", prefix, suffix));
    }

    #[test]
    fn test_brace_payload_is_removed(
        prefix in "[a-zA-Z .,!?]{0,30}",
        value in "[a-z{} ]{0,12}",
        number in 0u32..1000,
        suffix in "[a-zA-Z .,!?]{0,30}",
        cuts in prop::collection::vec(0usize..200, 0..8),
    ) {
        let payload = format!(
            "{{\"next_node\": \"{}\", \"nested\": {{\"n\": {}}}}}",
            value, number
        );
        let input = format!("{}\n{}{}", prefix, payload, suffix);
        let out = filtered(&fragments(&input, &cuts));
        prop_assert_eq!(out, format!("{}\n{}", prefix, suffix));
    }
}

#[test]
fn test_inline_brace_is_visible() {
    let out = filtered(&["Use a map like ".into(), "{a: 1}".into()]);
    assert_eq!(out, "Use a map like {a: 1}");
}

struct Setup {
    healthy: Arc<RecordingTransport>,
    flaky: Arc<RecordingTransport>,
    registry: Arc<ConnectionRegistry>,
    persistence: Arc<InMemoryPersistence>,
    multiplexer: StreamMultiplexer,
}

async fn setup(flaky_accepts: usize) -> Setup {
    let registry = Arc::new(ConnectionRegistry::new());
    let healthy = Arc::new(RecordingTransport::new());
    let flaky = Arc::new(RecordingTransport::failing_after(flaky_accepts));
    registry.subscribe("conv", healthy.clone()).await;
    registry.subscribe("conv", flaky.clone()).await;
    let persistence = Arc::new(InMemoryPersistence::new());

    Setup {
        healthy,
        flaky,
        registry: registry.clone(),
        persistence: persistence.clone(),
        multiplexer: StreamMultiplexer::new(registry, persistence),
    }
}

async fn drive(setup: &Setup, engine: &GraphEngine) {
    let (sink, events) = stream::channel();
    let run = async move {
        let result = engine.run("conv", "hi", Vec::new(), Vec::new(), &sink).await;
        drop(sink);
        result
    };
    let (result, forwarded) = tokio::join!(run, setup.multiplexer.forward("conv", events));
    result.unwrap();
    assert!(forwarded.unwrap().ended);
}

#[tokio::test]
async fn test_disconnect_mid_run_does_not_stop_run() {
    let setup = setup(1).await;
    let classifier = Arc::new(ScriptedClassifier::new(vec![Step::answer(
        "Final answer",
    )
    .with_tokens(&["Hello ", "world ", "again"])]));
    let engine = GraphEngine::new(
        classifier,
        uniform_handlers(Arc::new(CountingHandler::new("x"))),
        &GraphConfig::default(),
    );

    drive(&setup, &engine).await;

    // One accepted push, one failed push, then nothing more
    assert_eq!(setup.flaky.messages().len(), 1);
    assert_eq!(setup.flaky.messages()[0].status, MessageStatus::Streaming);
    assert_eq!(setup.flaky.attempts(), 2);

    assert_eq!(
        setup.persistence.get_history("conv", 10).await.unwrap(),
        vec![Turn::system("Final answer")]
    );
    assert_eq!(
        setup.healthy.statuses(),
        vec![
            MessageStatus::Streaming,
            MessageStatus::Streaming,
            MessageStatus::Streaming,
            MessageStatus::Completed
        ]
    );
    assert_eq!(setup.registry.subscriber_count("conv").await, 1);
}

#[tokio::test]
async fn test_messages_arrive_in_generation_order() {
    let setup = setup(usize::MAX).await;
    let classifier = Arc::new(ScriptedClassifier::new(vec![
        Step::dispatch(NodeTag::Company, "team").with_tokens(&["Checking ", "the team"]),
        Step::dispatch(NodeTag::Estimation, "cost").with_tokens(&["Now ", "pricing"]),
        Step::answer("All done").with_tokens(&["Wrapping up"]),
    ]));
    let engine = GraphEngine::new(
        classifier,
        uniform_handlers(Arc::new(CountingHandler::new("result"))),
        &GraphConfig::default(),
    );

    drive(&setup, &engine).await;

    let summary: Vec<String> = setup
        .healthy
        .messages()
        .iter()
        .map(|m: &ClientMessage| match m.status {
            MessageStatus::Tool => format!("tool:{}", m.tool_name.as_deref().unwrap_or("")),
            status => format!("{}:{}", status, m.message),
        })
        .collect();

    assert_eq!(
        summary,
        vec![
            "streaming:Checking ",
            "streaming:the team",
            "tool:company",
            "streaming:Now ",
            "streaming:pricing",
            "tool:estimation",
            "streaming:Wrapping up",
            "completed:All done",
        ]
    );
    assert_eq!(setup.healthy.messages(), setup.flaky.messages());
}

#[tokio::test]
async fn test_broadcast_to_empty_room_is_noop() {
    let registry = ConnectionRegistry::new();
    let report = registry
        .broadcast(&ClientMessage::new("nobody", MessageStatus::Started, "hi"))
        .await;
    assert_eq!(report.delivered, 0);
    assert_eq!(report.removed, 0);
}

#[tokio::test]
async fn test_last_unsubscribe_unlinks_room() {
    let registry = ConnectionRegistry::new();
    let first = registry
        .subscribe("conv", Arc::new(RecordingTransport::new()))
        .await;
    let second = registry
        .subscribe("conv", Arc::new(RecordingTransport::new()))
        .await;
    assert_eq!(registry.active_conversations().await, 1);

    assert!(registry.unsubscribe("conv", first).await);
    assert!(!registry.unsubscribe("conv", first).await);
    assert_eq!(registry.active_conversations().await, 1);

    assert!(registry.unsubscribe("conv", second).await);
    assert_eq!(registry.active_conversations().await, 0);
    assert_eq!(registry.subscriber_count("conv").await, 0);
}

#[tokio::test]
async fn test_all_subscribers_failing_unlinks_room() {
    let registry = ConnectionRegistry::new();
    registry
        .subscribe("conv", Arc::new(RecordingTransport::failing_after(0)))
        .await;

    let report = registry
        .broadcast(&ClientMessage::new("conv", MessageStatus::Streaming, "x"))
        .await;
    assert_eq!(report.removed, 1);
    assert_eq!(registry.active_conversations().await, 0);
}

#[tokio::test]
async fn test_history_append_failure_stops_forwarding() {
    let registry = Arc::new(ConnectionRegistry::new());
    let transport = Arc::new(RecordingTransport::new());
    registry.subscribe("conv", transport.clone()).await;
    let multiplexer = StreamMultiplexer::new(registry, Arc::new(RejectingPersistence::default()));

    let classifier = Arc::new(ScriptedClassifier::new(vec![Step::answer("lost")]));
    let engine = GraphEngine::new(
        classifier,
        uniform_handlers(Arc::new(CountingHandler::new("x"))),
        &GraphConfig::default(),
    );

    let (sink, events) = stream::channel();
    let run = async move {
        let result = engine.run("conv", "hi", Vec::new(), Vec::new(), &sink).await;
        drop(sink);
        result
    };
    let (_, forwarded) = tokio::join!(run, multiplexer.forward("conv", events));

    assert!(matches!(forwarded, Err(EngineError::Persistence(_))));
    assert!(!transport.statuses().contains(&MessageStatus::Completed));
}

#[tokio::test]
async fn test_stalled_reader_does_not_block_run() {
    let registry = Arc::new(ConnectionRegistry::new());
    let healthy = Arc::new(RecordingTransport::new());
    // Connected but never drained
    let (tx, _stalled) = mpsc::channel(2);
    registry.subscribe("conv", healthy.clone()).await;
    registry
        .subscribe("conv", Arc::new(ChannelTransport::new(tx)))
        .await;
    let persistence = Arc::new(InMemoryPersistence::new());
    let multiplexer = StreamMultiplexer::new(registry.clone(), persistence.clone());

    let classifier = Arc::new(ScriptedClassifier::new(vec![
        Step::answer("Final").with_tokens(&["one ", "two ", "three ", "four"]),
    ]));
    let engine = GraphEngine::new(
        classifier,
        uniform_handlers(Arc::new(CountingHandler::new("x"))),
        &GraphConfig::default(),
    );

    let (sink, events) = stream::channel();
    let run = async move {
        let result = engine.run("conv", "hi", Vec::new(), Vec::new(), &sink).await;
        drop(sink);
        result
    };
    let (result, forwarded) = tokio::time::timeout(
        Duration::from_secs(5),
        async { tokio::join!(run, multiplexer.forward("conv", events)) },
    )
    .await
    .expect("turn stalled behind a subscriber that stopped reading");

    result.unwrap();
    let forwarded = forwarded.unwrap();
    assert!(forwarded.ended);
    assert_eq!(forwarded.removed_subscribers, 1);

    assert_eq!(healthy.messages().len(), 5);
    assert_eq!(
        persistence.get_history("conv", 10).await.unwrap(),
        vec![Turn::system("Final")]
    );
    assert_eq!(registry.subscriber_count("conv").await, 1);
}
