use palaver_bot::{commands, config::BotConfig};
use palaver_dispatch::{Dispatcher, SessionProcessor};
use palaver_transport::{
    AcceptancePolicy, Ingress, NatsMessageSender, NatsRequestAcceptor, NatsScopeStore,
    chat_events, connect,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BotConfig::load().expect("failed to load configuration");
    tracing::info!(
        nats_url = %config.nats.url,
        scope_ttl_seconds = config.scope.ttl_seconds,
        routing_anchor = ?config.scope.routing_anchor,
        "Loaded configuration"
    );

    let client = connect(&config.nats)
        .await
        .expect("failed to connect to NATS");

    let store = NatsScopeStore::open(client.clone(), &config.nats.scope_bucket, config.scope_ttl())
        .await
        .expect("failed to open scope bucket");
    let sender = NatsMessageSender::new(client.clone(), &config.nats)
        .await
        .expect("failed to set up outbound stream");

    let processor = Arc::new(
        SessionProcessor::new(store, Arc::new(sender)).with_config(config.processor_config()),
    );
    let registered = commands::register_built_ins(&processor)
        .await
        .expect("failed to register built-in commands");
    tracing::info!(commands = registered.len(), "Registered commands");

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&processor),
        config.dispatcher_config(),
    ));
    let policy = if config.ingress.auto_accept {
        AcceptancePolicy::AutoAccept(Arc::new(NatsRequestAcceptor::new(
            client.clone(),
            &config.nats,
        )))
    } else {
        AcceptancePolicy::Ignore
    };
    let ingress = Ingress::new(dispatcher).with_policy(policy);

    let events = chat_events(&client, &config.nats.events_subject)
        .await
        .expect("failed to subscribe to chat events");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received interrupt"),
            Err(e) => tracing::warn!(error = %e, "Failed to listen for interrupt"),
        }
        signal.cancel();
    });

    tracing::info!(subject = %config.nats.events_subject, "palaver is running");
    let dispatched = ingress.run(events, shutdown).await;

    if let Err(e) = processor.close().await {
        tracing::warn!(error = %e, "Failed to close scope store");
    }
    if let Err(e) = client.flush().await {
        tracing::warn!(error = %e, "Failed to flush NATS connection");
    }
    tracing::info!(dispatched, "palaver stopped");
}
