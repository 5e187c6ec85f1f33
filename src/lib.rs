use std::{sync::Arc, time::Duration};

use actix_web::{
    middleware::{Condition, NormalizePath, TrailingSlash},
    web::Data,
    App, HttpServer,
};
use broker::{memory::InMemoryBroker, ConsumerGroup, Producer};
use config::{BrokerKind, Config};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

use crate::{
    api::rate_limit::IpGate, error::Error, pipeline::Pipeline, service::Service, store::Store,
    updater::StatusUpdater, worker::ConsumerWorker,
};

pub mod api;
pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod pipeline;
pub mod publisher;
pub mod service;
pub mod store;
pub mod updater;
pub mod worker;

fn init_tracing() -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("MSGFLOW_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("MSGFLOW_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    Ok(())
}

/// Broker clients for the configured [`BrokerKind`].
///
/// The in-memory broker lives inside this process, so producer and consumer share one
/// instance.
pub struct Brokers {
    kind: BrokerKind,
    memory: InMemoryBroker,
}

impl Brokers {
    pub fn new(config: &Config) -> Self {
        Self {
            kind: config.broker,
            memory: InMemoryBroker::default(),
        }
    }

    pub fn producer(&self, config: &Config) -> Result<Arc<dyn Producer>, Error> {
        match self.kind {
            BrokerKind::Memory => Ok(Arc::new(self.memory.clone())),
            #[cfg(feature = "kafka")]
            BrokerKind::Kafka => Ok(Arc::new(broker::kafka::KafkaProducer::new(config)?)),
            #[cfg(not(feature = "kafka"))]
            BrokerKind::Kafka => Err(Error::fatal_broker(format!(
                "cannot reach {}: built without the `kafka` feature",
                config.kafka_brokers()
            ))),
        }
    }

    pub fn consumer_group(&self, config: &Config) -> Result<Arc<dyn ConsumerGroup>, Error> {
        match self.kind {
            BrokerKind::Memory => Ok(Arc::new(
                self.memory
                    .consumer_group(config.group_id(), config.topic()),
            )),
            #[cfg(feature = "kafka")]
            BrokerKind::Kafka => Ok(Arc::new(broker::kafka::KafkaConsumerGroup::new(config)?)),
            #[cfg(not(feature = "kafka"))]
            BrokerKind::Kafka => Err(Error::fatal_broker(format!(
                "cannot reach {}: built without the `kafka` feature",
                config.kafka_brokers()
            ))),
        }
    }
}

/// A running consumer worker and the updater it feeds.
struct Consumer {
    handle: JoinHandle<Result<(), Error>>,
    updater: Option<Arc<StatusUpdater>>,
}

impl Consumer {
    fn spawn(
        config: &Config,
        store: &Store,
        group: Arc<dyn ConsumerGroup>,
        shutdown: CancellationToken,
    ) -> Self {
        let updater = config
            .async_status_updates()
            .then(|| Arc::new(StatusUpdater::new(store.clone(), config.status_queue_capacity())));

        let pipeline = Pipeline::from_config(store.clone(), config, updater.clone());

        let worker = ConsumerWorker::new(group, pipeline);
        let handle = tokio::spawn(async move {
            let result = worker.run(shutdown.clone()).await;
            // Lets a consumer-only process exit once the worker has stopped.
            shutdown.cancel();
            result
        });

        Self { handle, updater }
    }

    async fn stop(self, timeout: Duration) {
        let mut handle = self.handle;

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "consumer worker exited with an error"),
            Ok(Err(e)) => warn!(error = %e, "consumer worker task failed"),
            Err(_) => {
                warn!(?timeout, "consumer worker did not stop in time");
                handle.abort();
            }
        }

        if let Some(updater) = self.updater {
            updater.close(timeout).await;
        }
    }
}

/// Returns a builder for the main application.
///
/// Without an explicit `config` it is read from `MSGFLOW_*` environment variables.
#[bon::builder(finish_fn = start)]
pub async fn run(config: Option<Config>) -> eyre::Result<()> {
    init_tracing()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    info!(role = %config.role, broker = %config.broker, "starting msgflow");

    let store = Store::connect(&config).await?;
    let brokers = Brokers::new(&config);
    let shutdown = CancellationToken::new();

    let consumer = if config.role.consumes() {
        let group = brokers.consumer_group(&config)?;
        Some(Consumer::spawn(&config, &store, group, shutdown.clone()))
    } else {
        None
    };

    let service = if config.role.serves_http() {
        let service = Service::builder()
            .config(config.clone())
            .store(store.clone())
            .producer(brokers.producer(&config)?)
            .build();
        let data = Data::new(service);

        let rate_limit_enabled = config.rate_limit_enabled();
        let gate = IpGate::from_config(&config);

        let server = HttpServer::new({
            let data = data.clone();
            move || {
                App::new()
                    .wrap(Condition::new(rate_limit_enabled, gate.clone()))
                    .wrap(NormalizePath::new(TrailingSlash::Trim))
                    .wrap(TracingLogger::default())
                    .app_data(data.clone())
                    .app_data(api::json_config())
                    .configure(api::configure)
            }
        })
        .shutdown_timeout(config.shutdown_timeout().as_secs())
        .bind((config.host(), config.port()))?
        .run();

        info!(host = config.host(), port = config.port(), "HTTP server listening");

        // Handles SIGINT/SIGTERM itself and resolves once stopped.
        server.await?;

        Some(data)
    } else {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("shutdown signal received");
            }
            _ = shutdown.cancelled() => warn!("consumer worker stopped"),
        }
        None
    };

    shutdown.cancel();

    if let Some(consumer) = consumer {
        consumer.stop(config.shutdown_timeout()).await;
    }

    if let Some(service) = service {
        service.close().await;
    }

    store.close().await;

    info!("msgflow stopped");

    Ok(())
}
