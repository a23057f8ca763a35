//! usermesh-user: profile projection service
//!
//! Consumes `UserRegistered` events and creates one profile row per user.
//! Redelivered events are no-ops; events that keep failing are moved to the
//! dead letter queue once they reach `broker.max_deliveries`.
//!
//! ## Configuration
//! - RABBITMQ_URL: broker connection string
//! - DATABASE_URL: PostgreSQL connection string
//! - PORT: HTTP port for the probes (default 3000)
//! - USERMESH_CONFIG / --config: optional YAML file

use std::sync::Arc;

use tracing::{error, info, warn, Instrument};

use usermesh::broker::{AmqpConnector, BrokerSession, Consumer};
use usermesh::config::{Config, ConfigError, ServiceRole};
use usermesh::dlq::create_sink;
use usermesh::http;
use usermesh::projection::{PostgresProfileStore, ProfileProjector};
use usermesh::storage::connect_postgres;
use usermesh::utils::bootstrap::{config_path_arg, init_tracing, service_span};
use usermesh::utils::shutdown::ShutdownSignal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(config_path_arg().as_deref())
        .and_then(|config| config.validate_for(ServiceRole::User).map(|_| config))
        .map_err(|e| {
            error!("Invalid configuration: {}", e);
            e
        })?;

    let span = service_span(&config.service.name);
    run(config).instrument(span).await
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting usermesh-user");

    let broker_url = config
        .broker
        .url
        .as_deref()
        .ok_or(ConfigError::Missing("broker.url"))?;
    let connector = AmqpConnector::new(broker_url).with_connection_name(&config.service.name);
    let session = BrokerSession::new(Arc::new(connector), config.broker.session_config());
    session.start().await;

    let pool = connect_postgres(&config.database).await?;
    let profiles = PostgresProfileStore::new(pool);
    if config.database.init_schema {
        profiles.init_schema().await?;
    }

    let consumer = Consumer::new(
        session.clone(),
        config.broker.consumer_config(&config.service.name),
        Arc::new(ProfileProjector::new(Arc::new(profiles))),
        create_sink(&session, config.broker.dead_letter_queue()),
    )
    .subscribe();

    let app = http::probe_router(session.clone(), config.broker.readiness_grace());

    let shutdown = ShutdownSignal::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { shutdown.listen_for_os_signals().await }
    });

    let served = http::serve(app, &config.service.bind_addr(), shutdown).await;

    if !consumer.shutdown(config.broker.drain_timeout()).await {
        warn!("Some deliveries were still in flight at shutdown; the broker will redeliver them");
    }
    session.shutdown().await;
    info!("usermesh-user stopped");
    served.map_err(Into::into)
}
