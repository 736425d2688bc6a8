// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Entry point for `brooder-demo`: a single binary that plays all three
//! roles a cluster needs (§6 "Spawn interface") — `arbiter`, `actor`, and the
//! `demo` scenario driver that opens a nursery on itself.

mod cli;
mod config;
mod modules;
mod shutdown;

use std::error::Error;

use brooder::{
    actor::{bootstrap_actor, ActorConfig, ActorState},
    arbiter::run_arbiter,
    ident::Uid,
    nursery::{registry_snapshot, ActorSpawner, Nursery},
    portal::RunResult,
    Runtime, RuntimeScope,
};
use clap::Parser;
use futures::StreamExt;
use serde_json::json;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use crate::{
    cli::{ClArgs, Command, DemoModule},
    config::Config,
    shutdown::shutdown_signal_listener,
};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let cl_args = ClArgs::parse();
    let config = match Config::load(&cl_args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    set_up_logging(&config);

    std::panic::set_hook(Box::new(|p| {
        tracing::error!("{}", p);
    }));

    let result: Result<(), brooder::error::BrooderError> = match &cl_args.command {
        Command::Arbiter => run_arbiter(config.arbiter_addr, Uid::new("arbiter")).await,
        Command::Actor { name, parent_addr, module } => run_actor_mode(&config, name, *parent_addr, *module).await,
        Command::Demo => Runtime::launch(|scope| run_demo(scope, config)).await.map_err(Into::into),
    };

    if let Err(e) = result {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn set_up_logging(config: &Config) {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env().add_directive(config.tracing_level().into()))
        .init();
}

async fn run_actor_mode(
    config: &Config,
    name: &str,
    parent_addr: Option<std::net::SocketAddr>,
    module: DemoModule,
) -> Result<(), brooder::error::BrooderError> {
    let actor_config = ActorConfig {
        name: name.to_owned(),
        bind_addr: config.bind_addr,
        arbiter_addr: config.arbiter_addr,
        parent_addr,
        rpc_modules: vec![module.as_str().to_owned()],
        loglevel: config.tracing_level(),
    };
    let state = ActorState::new();
    let runtime_cell = modules::runtime_cell();
    let dispatcher = modules::build(module, state, runtime_cell.clone());
    let bound = bootstrap_actor(actor_config, dispatcher).await?;
    let _ = runtime_cell.set(bound.runtime.clone());
    bound.join().await;
    Ok(())
}

/// Drives the end-to-end scenario: a root actor opens a nursery on itself,
/// spawns one child per RPC module, and exercises peer discovery, streaming,
/// pub/sub fan-out, and a remote error in turn (§8 "Demo scenario").
async fn run_demo(scope: &mut RuntimeScope, config: Config) -> Result<(), Box<dyn Error + Send + Sync>> {
    let arbiter_addr = config.arbiter_addr;
    scope
        .spawn_task(move |_| async move {
            run_arbiter(arbiter_addr, Uid::new("arbiter")).await?;
            Ok(())
        })
        .await;
    // Give the arbiter a moment to bind before anything tries to register.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let root_config = ActorConfig {
        name: "root".into(),
        bind_addr: config.bind_addr,
        arbiter_addr: config.arbiter_addr,
        parent_addr: None,
        rpc_modules: Vec::new(),
        loglevel: config.tracing_level(),
    };
    let bound = bootstrap_actor(root_config, brooder::Dispatcher::new()).await?;
    let shutdown_handle = bound.shutdown.clone();
    scope
        .spawn_task(move |_| async move {
            shutdown_signal_listener().await;
            shutdown_handle.shutdown();
            Ok(())
        })
        .await;

    let nursery = Nursery::open(&bound.runtime, ActorSpawner::current_exe()?, config.cancel_deadline);

    // S2 — peer discovery: spawn an actor, call one of its functions.
    let greeter = nursery
        .start_actor("greeter", "127.0.0.1:0".parse()?, vec!["greet".into()], json!(null), config.tracing_level())
        .await?;
    let greeting: String = greeter.run("greet", "hi", json!({})).await?.into_single()?;
    tracing::info!(%greeting, "S2 complete");

    // S3 — streaming results.
    let counter = nursery
        .start_actor("counter", "127.0.0.1:0".parse()?, vec!["counter".into()], json!(null), config.tracing_level())
        .await?;
    let mut ticks = counter.run_streaming("counter", "count_up", json!({})).await?.into_stream();
    while let Some(tick) = ticks.next().await {
        tracing::info!(?tick, "S3 tick");
    }

    // S4 — pub/sub fan-out: two subscribers join overlapping topic sets.
    let publisher = nursery
        .start_actor("publisher", "127.0.0.1:0".parse()?, vec!["publisher".into()], json!(null), config.tracing_level())
        .await?;
    let sub_t1 = publisher
        .run_streaming("publisher", "feed", json!({ "topics": ["t1"] }))
        .await?
        .into_stream()
        .take(3)
        .collect::<Vec<_>>();
    let sub_t1_t2 = publisher
        .run_streaming("publisher", "feed", json!({ "topics": ["t1", "t2"] }))
        .await?
        .into_stream()
        .take(3)
        .collect::<Vec<_>>();
    let (items_t1, items_t1_t2) = tokio::join!(sub_t1, sub_t1_t2);
    tracing::info!(?items_t1, subscriber = "t1", "S4 items");
    tracing::info!(?items_t1_t2, subscriber = "t1+t2", "S4 items");

    // S5 — registry snapshot: every actor started above should be listed.
    let registry = registry_snapshot(config.arbiter_addr, bound.runtime.uid.clone()).await?;
    for (uid, addrs) in &registry {
        tracing::info!(%uid, ?addrs, "S5 registry entry");
    }

    // S6 — remote error: dividing by zero surfaces a RemoteError.
    let mathematician = nursery
        .start_actor("mathematician", "127.0.0.1:0".parse()?, vec!["math".into()], json!(null), config.tracing_level())
        .await?;
    match mathematician.run("math", "divide", json!({ "numerator": 1.0, "denominator": 0.0 })).await {
        Err(e) => tracing::info!(error = %e, "S6 remote error as expected"),
        Ok(RunResult::Single(v)) => tracing::warn!(?v, "S6 expected a RemoteError but got a value"),
        Ok(RunResult::Stream(_)) => tracing::warn!("S6 expected a RemoteError but got a stream"),
    }

    nursery.close(false).await?;
    bound.shutdown();
    bound.join().await;
    Ok(())
}
