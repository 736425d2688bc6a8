// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The demo RPC modules dispatched over an actor's [`brooder::Dispatcher`]
//! (§8 scenarios S2, S3, S4, S6). Each actor process only registers the one
//! module named on its `--module` flag, so the allow-list stays exactly the
//! set the actor was started with (§4.6).

use std::{sync::Arc, time::Duration};

use brooder::{
    actor::{ActorRuntime, ActorState},
    dispatch::{Dispatcher, RemoteError, RpcOutcome},
    pubsub::{self, PublisherRegistry},
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::OnceCell;

/// Resolved only once the actor has finished registering (§4.1); handlers
/// are declared before that point exists, so they close over this cell
/// instead of the runtime itself.
pub type RuntimeCell = Arc<OnceCell<Arc<ActorRuntime>>>;

pub fn runtime_cell() -> RuntimeCell {
    Arc::new(OnceCell::new())
}

/// `greet::hi()` — returns the actor's own greeting (§8 "S2 — peer
/// discovery").
pub fn register_greet(dispatcher: &mut Dispatcher, runtime: RuntimeCell) {
    dispatcher.register("greet", "hi", move |_kwargs: Value| {
        let runtime = runtime.clone();
        async move {
            let runtime = runtime.get().expect("actor runtime not yet installed");
            Ok(RpcOutcome::Single(Value::String(format!("Hi my name is {}", runtime.uid.name))))
        }
    });
}

/// `counter::count_up()` — streams integers `0..10`, 10ms apart (§8 "S3 —
/// streaming").
pub fn register_counter(dispatcher: &mut Dispatcher) {
    dispatcher.register("counter", "count_up", |_kwargs: Value| async move {
        let stream = futures::stream::unfold(0u32, |n| async move {
            if n >= 10 {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            Some((Value::from(n), n + 1))
        });
        Ok(RpcOutcome::Stream(Box::pin(stream)))
    });
}

#[derive(Deserialize)]
struct SubscribeArgs {
    topics: Vec<String>,
    #[serde(default)]
    task_name: Option<String>,
}

/// `publisher::feed()` — declares the `"s1"` task slot and produces
/// alternating `{"t1": v}` / `{"t2": v}` mappings, exercising the fan-out
/// primitive end to end (§8 "S4 — pub/sub fan-out").
pub fn register_publisher(dispatcher: &mut Dispatcher, state: Arc<ActorState>) {
    dispatcher.register("publisher", "feed", move |kwargs: Value| {
        let state = state.clone();
        async move {
            let args: SubscribeArgs =
                serde_json::from_value(kwargs).map_err(|e| RemoteError::new("InvalidArgs", e.to_string()))?;

            let registry = state
                .get_or_insert_with(|| PublisherRegistry::new(["s1".to_string()]))
                .await;
            let (ctx, stream) = pubsub::subscriber_channel();

            tokio::spawn({
                let registry = registry.clone();
                async move {
                    let producer = Arc::new(|get_topics: pubsub::GetTopics| {
                        let stream = futures::stream::unfold(0u64, move |v| {
                            let get_topics = get_topics.clone();
                            async move {
                                tokio::time::sleep(Duration::from_millis(10)).await;
                                let mut item = std::collections::HashMap::new();
                                for topic in get_topics() {
                                    item.insert(topic, Value::from(v));
                                }
                                Some((Ok(item), v + 1))
                            }
                        });
                        Box::pin(stream) as futures::stream::BoxStream<'static, pubsub::ProducedItem>
                    });
                    if let Err(e) = registry
                        .publish(args.task_name, args.topics, None, ctx, producer)
                        .await
                    {
                        tracing::warn!(error = %e, "publisher feed ended with an error");
                    }
                }
            });

            Ok(RpcOutcome::Stream(stream))
        }
    });
}

#[derive(Deserialize)]
struct DivideArgs {
    numerator: f64,
    denominator: f64,
}

/// `math::divide()` — raises a `RemoteError` on division by zero (§8 "S6 —
/// remote error").
pub fn register_math(dispatcher: &mut Dispatcher) {
    dispatcher.register("math", "divide", |kwargs: Value| async move {
        let args: DivideArgs = serde_json::from_value(kwargs).map_err(|e| RemoteError::new("InvalidArgs", e.to_string()))?;
        if args.denominator == 0.0 {
            return Err(RemoteError::new("ZeroDivisionError", "division by zero"));
        }
        Ok(RpcOutcome::Single(Value::from(args.numerator / args.denominator)))
    });
}

/// Builds the dispatcher for a single-module actor process, the way
/// `--module` names it.
pub fn build(module: crate::cli::DemoModule, state: Arc<ActorState>, runtime: RuntimeCell) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    match module {
        crate::cli::DemoModule::Greet => register_greet(&mut dispatcher, runtime),
        crate::cli::DemoModule::Counter => register_counter(&mut dispatcher),
        crate::cli::DemoModule::Publisher => register_publisher(&mut dispatcher, state),
        crate::cli::DemoModule::Math => register_math(&mut dispatcher),
    }
    dispatcher
}
