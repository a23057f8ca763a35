//! usermesh-auth: account registration service
//!
//! Stores accounts in PostgreSQL and announces each one as a
//! `UserRegistered` event. The HTTP path never waits on the broker: if
//! messaging is down the account is still created and the event is skipped
//! with a warning.
//!
//! ## Configuration
//! - RABBITMQ_URL: broker connection string
//! - DATABASE_URL: PostgreSQL connection string
//! - PORT: HTTP port (default 3000)
//! - USERMESH_CONFIG / --config: optional YAML file

use std::sync::Arc;

use tracing::{error, info, Instrument};

use usermesh::accounts::{PostgresAccountStore, RegistrationService};
use usermesh::broker::{AmqpConnector, BrokerSession, Publisher};
use usermesh::config::{Config, ConfigError, ServiceRole};
use usermesh::http::{self, auth};
use usermesh::storage::connect_postgres;
use usermesh::utils::bootstrap::{config_path_arg, init_tracing, service_span};
use usermesh::utils::shutdown::ShutdownSignal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(config_path_arg().as_deref())
        .and_then(|config| config.validate_for(ServiceRole::Auth).map(|_| config))
        .map_err(|e| {
            error!("Invalid configuration: {}", e);
            e
        })?;

    let span = service_span(&config.service.name);
    run(config).instrument(span).await
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting usermesh-auth");

    let broker_url = config
        .broker
        .url
        .as_deref()
        .ok_or(ConfigError::Missing("broker.url"))?;
    let connector = AmqpConnector::new(broker_url).with_connection_name(&config.service.name);
    let session = BrokerSession::new(Arc::new(connector), config.broker.session_config());
    session.start().await;

    let pool = connect_postgres(&config.database).await?;
    let accounts = PostgresAccountStore::new(pool);
    if config.database.init_schema {
        accounts.init_schema().await?;
    }

    let publisher = Publisher::new(session.clone(), config.broker.queue.clone())
        .with_handoff_timeout(config.broker.handoff_timeout());
    let service = RegistrationService::new(Arc::new(accounts), publisher);

    let app = auth::router(service).merge(http::probe_router(
        session.clone(),
        config.broker.readiness_grace(),
    ));

    let shutdown = ShutdownSignal::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { shutdown.listen_for_os_signals().await }
    });

    let served = http::serve(app, &config.service.bind_addr(), shutdown).await;

    session.shutdown().await;
    info!("usermesh-auth stopped");
    served.map_err(Into::into)
}
