//! End-to-end scenarios for the client: dedup, streaming, cancellation,
//! inactivity GC and rejection.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use composable_query_core::{FetchContext, FetchError, FetchOutcome, QueryState, Request, RequestKind};
use composable_query_runtime::Client;
use composable_query_testing::{
    init_test_tracing, settle, ControlledHandler, CountingHandler, ManualScheduler,
    RecordingSubscriber, StreamHandler,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ===== Test Fixtures =====

fn client_with<H>(handler: H, scheduler: &ManualScheduler) -> Client
where
    H: composable_query_core::FetchHandler + 'static,
{
    Client::builder(handler)
        .scheduler(Arc::new(scheduler.clone()))
        .build()
}

// ===== Deduplication =====

#[tokio::test]
async fn concurrent_fetches_share_one_handler_call() {
    init_test_tracing();
    let handler = ControlledHandler::new();
    let client = client_with(handler.clone(), &ManualScheduler::new());
    let req = Request::single(json!({ "query": "a" })).unwrap();

    let first = RecordingSubscriber::new();
    let second = RecordingSubscriber::new();
    let _a = client.fetch(&req, Some(first.subscriber())).unwrap();
    let _b = client.fetch(&req, Some(second.subscriber())).unwrap();

    assert_eq!(handler.calls(), 1);
    assert_eq!(client.state_of(req.id()), Some(QueryState::Fetching));

    assert!(handler.resolve_next(json!({ "users": ["ada"] })));
    settle().await;

    for recorder in [&first, &second] {
        assert_eq!(recorder.states(), vec![QueryState::Completed]);
        assert_eq!(recorder.data(), vec![Some(json!({ "users": ["ada"] }))]);
    }
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn equivalent_inputs_dedup_across_key_order() {
    let handler = ControlledHandler::new();
    let client = client_with(handler.clone(), &ManualScheduler::new());

    let a = Request::single(json!({ "query": "a", "vars": { "x": 1, "y": 2 } })).unwrap();
    let b = Request::single(json!({ "vars": { "y": 2, "x": 1 }, "query": "a" })).unwrap();
    client.prefetch(&a).unwrap();
    client.prefetch(&b).unwrap();

    assert_eq!(handler.calls(), 1);
}

// ===== Streaming =====

#[tokio::test]
async fn stream_values_then_complete_keeps_last_value() {
    init_test_tracing();
    let handler = StreamHandler::new();
    let client = client_with(handler.clone(), &ManualScheduler::new());
    let req = Request::build(json!({ "feed": "ticks" }), RequestKind::Stream).unwrap();

    let recorder = RecordingSubscriber::new();
    let _sub = client.fetch(&req, Some(recorder.subscriber())).unwrap();

    for n in 1..=3 {
        assert!(handler.push(json!(n)));
    }
    settle().await;
    handler.finish();
    settle().await;

    assert_eq!(
        recorder.states(),
        vec![
            QueryState::Streaming,
            QueryState::Streaming,
            QueryState::Streaming,
            QueryState::Completed,
        ]
    );
    assert_eq!(
        recorder.data(),
        vec![Some(json!(1)), Some(json!(2)), Some(json!(3)), Some(json!(3))]
    );
    assert_eq!(client.cached(req.id()), Some(json!(3)));
}

#[tokio::test]
async fn stream_fetch_while_streaming_joins_the_open_source() {
    let handler = StreamHandler::new();
    let client = client_with(handler.clone(), &ManualScheduler::new());
    let req = Request::stream(json!({ "feed": "news" })).unwrap();

    client.prefetch(&req).unwrap();
    handler.push(json!("first"));
    settle().await;
    assert_eq!(client.state_of(req.id()), Some(QueryState::Streaming));

    client.prefetch(&req).unwrap();
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn generated_stream_is_adapted_value_by_value() {
    let client = Client::builder(|_r: &Request, _c: FetchContext| {
        FetchOutcome::stream(async_stream::stream! {
            for n in 1..=3 {
                tokio::task::yield_now().await;
                yield Ok(json!({ "tick": n }));
            }
        })
    })
    .scheduler(Arc::new(ManualScheduler::new()))
    .build();
    let req = Request::stream(json!({ "feed": "generated" })).unwrap();

    let recorder = RecordingSubscriber::new();
    let _sub = client.fetch(&req, Some(recorder.subscriber())).unwrap();
    settle().await;

    assert_eq!(recorder.len(), 4);
    assert_eq!(recorder.last().unwrap().state, QueryState::Completed);
    assert_eq!(client.cached(req.id()), Some(json!({ "tick": 3 })));
}

#[tokio::test]
async fn generated_stream_failure_rejects() {
    let client = Client::builder(|_r: &Request, _c: FetchContext| {
        FetchOutcome::stream(async_stream::stream! {
            yield Ok(json!("only"));
            yield Err(anyhow::anyhow!("socket closed").into());
        })
    })
    .scheduler(Arc::new(ManualScheduler::new()))
    .build();
    let req = Request::stream(json!({ "feed": "fragile" })).unwrap();

    let recorder = RecordingSubscriber::new();
    let _sub = client.fetch(&req, Some(recorder.subscriber())).unwrap();
    settle().await;

    assert_eq!(recorder.states(), vec![QueryState::Streaming, QueryState::Failed]);
    assert_eq!(recorder.last().unwrap().error.as_deref(), Some("socket closed"));
}

// ===== Cancellation =====

#[tokio::test]
async fn cancel_before_resolution_suppresses_completion() {
    init_test_tracing();
    let handler = ControlledHandler::new();
    let client = client_with(handler.clone(), &ManualScheduler::new());
    let req = Request::single(json!({ "query": "slow" })).unwrap();

    let recorder = RecordingSubscriber::new();
    let sub = client.fetch(&req, Some(recorder.subscriber())).unwrap();
    sub.cancel().unwrap();
    settle().await;

    assert_eq!(client.state_of(req.id()), Some(QueryState::Idle));
    assert_eq!(handler.canceled(), 1);
    assert!(!handler.resolve_next(json!("late")));
    settle().await;
    assert!(recorder.is_empty());

    let _again = client.fetch(&req, None).unwrap();
    assert_eq!(handler.calls(), 2);
    assert!(handler.resolve_next(json!("fresh")));
    settle().await;

    assert_eq!(recorder.states(), vec![QueryState::Completed]);
    assert_eq!(client.cached(req.id()), Some(json!("fresh")));
}

#[tokio::test]
async fn canceled_stream_stops_delivering() {
    let handler = StreamHandler::new();
    let client = client_with(handler.clone(), &ManualScheduler::new());
    let req = Request::stream(json!({ "feed": "prices" })).unwrap();

    let recorder = RecordingSubscriber::new();
    let sub = client.fetch(&req, Some(recorder.subscriber())).unwrap();
    handler.push(json!(1));
    settle().await;

    sub.cancel().unwrap();
    handler.push(json!(2));
    settle().await;

    assert_eq!(recorder.data(), vec![Some(json!(1))]);
    assert_eq!(client.cached(req.id()), Some(json!(1)));
    assert!(!handler.is_open());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_from_another_thread_silences_a_busy_stream() {
    let client = Client::builder(|_r: &Request, _c: FetchContext| {
        FetchOutcome::stream(
            futures::stream::iter(0..2_000_000_u64).map(|n| Ok::<Value, FetchError>(json!(n))),
        )
    })
    .scheduler(Arc::new(ManualScheduler::new()))
    .build();

    for round in 0..50 {
        let req = Request::stream(json!({ "feed": "firehose", "round": round })).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sub = client
            .subscribe(&req, move |_state, _data, _err| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        while seen.load(Ordering::SeqCst) < 100 {
            tokio::task::yield_now().await;
        }
        sub.cancel().unwrap();
        let at_cancel = seen.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(client.state_of(req.id()), Some(QueryState::Idle), "round {round}");
        assert_eq!(seen.load(Ordering::SeqCst), at_cancel, "round {round}");
        sub.unsubscribe();
    }
}

// ===== Inactivity GC =====

#[tokio::test]
async fn prefetched_key_is_collected_after_max_age() {
    init_test_tracing();
    let scheduler = ManualScheduler::new();
    let handler = CountingHandler::new(|req: &Request, _ctx: FetchContext| {
        FetchOutcome::value(req.params().clone())
    });
    let client = client_with(handler, &scheduler);
    let req = Request::single(json!({ "query": "warm" })).unwrap();

    client.prefetch(&req).unwrap();
    assert_eq!(client.cached(req.id()), Some(json!({ "query": "warm" })));
    assert!(client.pending_gc(req.id()));

    scheduler.advance(Duration::from_millis(29_999));
    assert!(client.cached(req.id()).is_some());

    scheduler.advance(Duration::from_millis(1));
    assert_eq!(client.cached(req.id()), None);
    assert_eq!(client.state_of(req.id()), None);
    assert!(!client.pending_gc(req.id()));
}

#[tokio::test]
async fn subscribing_within_max_age_keeps_the_key() {
    let scheduler = ManualScheduler::new();
    let handler = ControlledHandler::new();
    let client = client_with(handler.clone(), &scheduler);
    let req = Request::single(json!({ "query": "kept" })).unwrap();

    client.prefetch(&req).unwrap();
    handler.resolve_next(json!("value"));
    settle().await;

    scheduler.advance(Duration::from_secs(10));
    let sub = client.fetch(&req, Some(RecordingSubscriber::new().subscriber())).unwrap();
    scheduler.advance(Duration::from_secs(60));
    assert_eq!(client.cached(req.id()), Some(json!("value")));

    sub.unsubscribe();
    scheduler.advance(Duration::from_secs(30));
    assert_eq!(client.cached(req.id()), None);
}

#[tokio::test]
async fn max_age_is_configurable() {
    let scheduler = ManualScheduler::new();
    let client = Client::builder(|_r: &Request, _c: FetchContext| {
        FetchOutcome::value(json!(1))
    })
    .max_age(Duration::from_secs(5))
    .scheduler(Arc::new(scheduler.clone()))
    .build();
    let req = Request::single(json!({})).unwrap();

    client.prefetch(&req).unwrap();
    scheduler.advance(Duration::from_secs(5));
    assert_eq!(client.cached(req.id()), None);
}

// ===== Rejection =====

#[tokio::test]
async fn rejection_keeps_previous_data_and_retries() {
    init_test_tracing();
    let handler = ControlledHandler::new();
    let client = client_with(handler.clone(), &ManualScheduler::new());
    let req = Request::single(json!({ "query": "flaky" })).unwrap();

    let recorder = RecordingSubscriber::new();
    let _sub = client.fetch(&req, Some(recorder.subscriber())).unwrap();
    handler.resolve_next(json!("v1"));
    settle().await;

    let _refetch = client.fetch(&req, None).unwrap();
    handler.reject_next("upstream unavailable");
    settle().await;

    let last = recorder.last().unwrap();
    assert_eq!(last.state, QueryState::Failed);
    assert_eq!(last.data, Some(json!("v1")));
    assert_eq!(last.error.as_deref(), Some("upstream unavailable"));
    assert_eq!(client.cached(req.id()), Some(json!("v1")));

    let _retry = client.fetch(&req, None).unwrap();
    assert_eq!(handler.calls(), 3);
    handler.resolve_next(json!("v2"));
    settle().await;

    assert_eq!(recorder.last().unwrap().state, QueryState::Completed);
    assert_eq!(client.cached(req.id()), Some(json!("v2")));
}

#[tokio::test]
async fn stream_error_rejects_and_keeps_buffered_data() {
    let handler = StreamHandler::new();
    let client = client_with(handler.clone(), &ManualScheduler::new());
    let req = Request::stream(json!({ "feed": "unstable" })).unwrap();

    let recorder = RecordingSubscriber::new();
    let _sub = client.fetch(&req, Some(recorder.subscriber())).unwrap();
    handler.push(json!("partial"));
    handler.fail("connection reset");
    settle().await;

    assert_eq!(recorder.states(), vec![QueryState::Streaming, QueryState::Failed]);
    assert_eq!(recorder.last().unwrap().data, Some(json!("partial")));
    assert_eq!(client.cached(req.id()), Some(json!("partial")));
}
