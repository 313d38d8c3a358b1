//! `streamfold`: emit clicks, count them per user, serve the counts.
//!
//! `GET http://{host}:{port}/user-3` answers `{"Clicks":N}` or `null`.

use std::error::Error;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;

use streamfold::query::serve;
use streamfold::{
    Broker, Config, Emitter, JsonCodec, KeyRotation, Processor, StringCodec, UserClicks, View,
    now_payload, run_ticker,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Config::parse();
    config.validate()?;
    tracing::info!(
        topic = %config.topic,
        consume = %config.consume,
        group = %config.group,
        srv_addr = %config.srv_addr(),
        partitions = config.partitions,
        data_dir = ?config.data_dir,
        "streamfold starting"
    );

    let broker = match &config.data_dir {
        Some(dir) => Broker::open(dir)?,
        None => Broker::in_memory(),
    };

    let emitter = Emitter::new(broker.clone(), &config.topic, config.partitions, StringCodec)?;
    broker.create_topic(&config.consume, config.partitions)?;

    let processor = Processor::<UserClicks>::builder(broker.clone())
        .group(&config.group)
        .input(&config.consume, StringCodec)
        .persist(JsonCodec::<UserClicks>::new())
        .build()?
        .start()?;

    let view = View::<UserClicks>::builder(broker.clone())
        .table(processor.changelog_topic(), JsonCodec::<UserClicks>::new())
        .open()?;

    let view_handle = view.handle();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind(config.srv_addr()).await?;
    let mut server = tokio::spawn(serve(listener, view.clone(), shutdown_rx.clone()));
    let mut ticker = tokio::spawn(run_ticker(
        emitter,
        config.emit_interval(),
        KeyRotation::new("user-", config.keys),
        now_payload,
        shutdown_rx,
    ));

    let outcome: Result<(), Box<dyn Error>> = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            signal.map_err(Into::into)
        }
        processed = processor.join() => {
            tracing::error!("processor stopped");
            processed.map_err(Into::into)
        }
        replicated = view_handle.join() => {
            tracing::error!("view stopped");
            replicated.map_err(Into::into)
        }
        emitted = &mut ticker => match emitted {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(e.into()),
        },
        served = &mut server => match served {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(e.into()),
        },
    };

    let _ = shutdown_tx.send(true);
    if let Err(e) = processor.shutdown().await {
        tracing::warn!(error = %e, "processor shutdown reported an error");
    }
    if let Err(e) = view_handle.shutdown().await {
        tracing::warn!(error = %e, "view shutdown reported an error");
    }
    if !ticker.is_finished() {
        let _ = ticker.await;
    }
    if !server.is_finished() {
        let _ = server.await;
    }
    tracing::info!("streamfold stopped");
    outcome
}
