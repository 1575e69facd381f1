//! Property tests: arbitrary command sequences against a synchronous
//! handler keep cache and state consistent.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use composable_query_core::{FetchContext, FetchOutcome, QueryState, Request};
use composable_query_runtime::Client;
use composable_query_testing::{ManualScheduler, RecordingSubscriber};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
enum Command {
    Fetch(u8),
    Cancel(u8),
    Dispose(u8),
}

fn command() -> impl Strategy<Value = Command> {
    prop_oneof![
        (0u8..3).prop_map(Command::Fetch),
        (0u8..3).prop_map(Command::Cancel),
        (0u8..3).prop_map(Command::Dispose),
    ]
}

fn request(n: u8) -> Request {
    Request::single(json!({ "item": n })).unwrap()
}

proptest! {
    #[test]
    fn completed_keys_always_have_cached_data(commands in prop::collection::vec(command(), 1..40)) {
        let client = Client::builder(|req: &Request, _c: FetchContext| {
            FetchOutcome::value(req.params().clone())
        })
        .scheduler(Arc::new(ManualScheduler::new()))
        .build();
        let recorder = RecordingSubscriber::new();

        for command in commands {
            match command {
                Command::Fetch(n) => {
                    let _sub = client.fetch(&request(n), Some(recorder.subscriber())).unwrap();
                }
                Command::Cancel(n) => client.cancel(&request(n)).unwrap(),
                Command::Dispose(n) => client.dispose(request(n).id()).unwrap(),
            }
        }

        for n in 0..3 {
            let req = request(n);
            match client.state_of(req.id()) {
                Some(QueryState::Completed) => {
                    prop_assert_eq!(client.cached(req.id()), Some(json!({ "item": n })));
                }
                None => prop_assert!(client.cached(req.id()).is_none()),
                Some(other) => prop_assert!(false, "unexpected settled state {other}"),
            }
        }

        // Synchronous handlers never leave work in flight
        prop_assert!(recorder.states().iter().all(|s| *s == QueryState::Completed));
    }
}
