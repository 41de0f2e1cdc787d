use std::sync::{Arc, LazyLock};

use anyhow::Context;
use courier_common::{Signal, internal, logging, tracing};
use courier_delivery::{
    Consumer, EmailProvider, IntakeService, Pipeline, RendererConfig, SmtpConfig, SmtpProvider,
    TemplateRenderer,
};
use courier_queue::{Broker, Publisher, QueueConfig};
use courier_store::{StoreConfig, Stores};
use serde::Deserialize;
use tokio::sync::broadcast;

/// Worker configuration, read from `courier.config.ron`
///
/// Every section is optional and falls back to the local development
/// defaults.
#[derive(Debug, Default, Deserialize)]
pub struct Courier {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub renderer: RendererConfig,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    tokio::signal::ctrl_c().await?;
    internal!(level = WARN, "Forced shutdown, in-flight deliveries will be redelivered");
    std::process::exit(130);
}

/// Everything a running worker is made of
#[derive(Debug)]
pub struct Worker {
    pub broker: Arc<dyn Broker>,
    pub stores: Stores,
    pub provider: Arc<dyn EmailProvider>,
    pub consumer: Consumer,
    pub intake: IntakeService,
}

impl Courier {
    /// Connect to the broker, declare the topology and wire the services.
    ///
    /// # Errors
    /// If the broker cannot be reached, the topology is rejected, or the
    /// SMTP transport cannot be built
    pub async fn build(self) -> anyhow::Result<Worker> {
        let topology = &self.queue.topology;
        let stores = self.store.into_stores();

        let broker = self
            .queue
            .broker
            .connect()
            .await
            .context("Unable to connect to the broker")?;
        broker
            .declare(topology)
            .await
            .context("Unable to declare the queue topology")?;
        internal!(
            level = INFO,
            "Declared {} with {} retry rungs",
            topology.queue,
            topology.retry.len()
        );

        let provider: Arc<dyn EmailProvider> =
            Arc::new(SmtpProvider::new(&self.smtp).context("Unable to build the SMTP transport")?);
        let renderer = Arc::new(TemplateRenderer::new(&self.renderer));

        let consumer = Consumer::new(
            Arc::clone(&broker),
            Pipeline::from_stores(&stores, renderer, Arc::clone(&provider)),
            topology.queue.clone(),
            self.queue.prefetch,
        );
        let intake = IntakeService::new(
            stores.messages.clone(),
            Publisher::new(Arc::clone(&broker), topology),
        );

        Ok(Worker {
            broker,
            stores,
            provider,
            consumer,
            intake,
        })
    }

    /// Run the worker until SIGINT or SIGTERM, then drain.
    ///
    /// # Errors
    /// If the worker cannot be built, or the consumer fails
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        internal!(level = INFO, "Courier starting");

        let worker = self.build().await?;

        if !worker.provider.validate_connection().await {
            tracing::warn!(
                provider = worker.provider.name(),
                "Provider is not reachable, deliveries will be retried until it is"
            );
        }

        let receiver = SHUTDOWN_BROADCAST.subscribe();
        let signals = tokio::spawn(shutdown());

        let result = worker.consumer.run(receiver).await;
        signals.abort();

        internal!(level = INFO, "Shutting down...");
        if let Err(e) = worker.broker.close().await {
            tracing::warn!(error = %e, "Broker connection did not close cleanly");
        }

        result.map_err(Into::into)
    }
}
