//! Infrastructure wiring: event store, outbox pump, broker, registry and the
//! read projection.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use instapay_infra::{
    broker::{BrokerError, InMemoryStreamBroker, RedisStreamBroker, StreamBroker},
    command_dispatcher::{CommandDispatcher, DispatchError},
    consumer::StreamConsumer,
    event_store::{EventStore, EventStoreError, InMemoryEventStore, PostgresEventStore, StoredEvent},
    outbox::{OutboxPump, OutboxStore},
    projections::{ProjectionError, TransactionProjection, TransactionView},
    read_model::InMemoryReadModelStore,
    registry::{InMemoryKeyRegistry, KeyRegistry, PostgresKeyRegistry},
    workers::{ProjectionHandler, WorkerHandle, spawn_supervised},
};
use instapay_transactions::{Transaction, TransactionCommand, TransactionId, projection_destination};

use crate::config::{Settings, StreamTuning};

pub const AGGREGATE_TYPE: &str = "transaction";
const PROJECTION_GROUP: &str = "projection";
const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

pub type TransactionViews = TransactionProjection<InMemoryReadModelStore<TransactionId, TransactionView>>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("event store: {0}")]
    Store(#[from] EventStoreError),

    #[error("broker: {0}")]
    Broker(#[from] BrokerError),
}

pub struct AppServices {
    dispatcher: CommandDispatcher<Arc<dyn EventStore>>,
    outbox: Arc<dyn OutboxStore>,
    broker: Arc<dyn StreamBroker>,
    registry: Arc<dyn KeyRegistry>,
    projection: Arc<TransactionViews>,
    waker: Arc<Notify>,
    tuning: StreamTuning,
}

impl AppServices {
    /// Wire services over explicit backends.
    pub fn new<S>(
        store: Arc<S>,
        broker: Arc<dyn StreamBroker>,
        registry: Arc<dyn KeyRegistry>,
        tuning: StreamTuning,
    ) -> Self
    where
        S: EventStore + OutboxStore + 'static,
    {
        let waker = Arc::new(Notify::new());
        let events: Arc<dyn EventStore> = store.clone();
        let dispatcher = CommandDispatcher::new(events)
            .with_fan_out(projection_destination())
            .with_outbox_waker(waker.clone());

        Self {
            dispatcher,
            outbox: store,
            broker,
            registry,
            projection: Arc::new(TransactionProjection::new(InMemoryReadModelStore::new())),
            waker,
            tuning,
        }
    }

    /// Fully in-memory wiring (dev/test).
    pub fn in_memory(registry: Arc<dyn KeyRegistry>, tuning: StreamTuning) -> Self {
        Self::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryStreamBroker::new()),
            registry,
            tuning,
        )
    }

    /// Postgres when `DATABASE_URL` is set and Redis when `REDIS_URL` is set,
    /// in-memory otherwise.
    pub async fn from_settings(settings: &Settings) -> Result<Self, BuildError> {
        let broker: Arc<dyn StreamBroker> = match &settings.redis_url {
            Some(url) => {
                info!("using Redis Streams broker");
                Arc::new(RedisStreamBroker::connect(url).await?)
            }
            None => {
                warn!("REDIS_URL not set; using in-memory broker");
                Arc::new(InMemoryStreamBroker::new())
            }
        };

        match &settings.database_url {
            Some(url) => {
                let store = PostgresEventStore::connect(url).await?;
                store.init_schema().await?;
                info!("using Postgres event store");
                let registry = Arc::new(PostgresKeyRegistry::new(store.pool().clone()));
                Ok(Self::new(Arc::new(store), broker, registry, settings.tuning.clone()))
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory event store and an empty key registry");
                Ok(Self::new(
                    Arc::new(InMemoryEventStore::new()),
                    broker,
                    Arc::new(InMemoryKeyRegistry::new()),
                    settings.tuning.clone(),
                ))
            }
        }
    }

    pub fn broker(&self) -> &Arc<dyn StreamBroker> {
        &self.broker
    }

    pub fn registry(&self) -> &dyn KeyRegistry {
        self.registry.as_ref()
    }

    pub fn projection(&self) -> &TransactionViews {
        &self.projection
    }

    pub fn tuning(&self) -> &StreamTuning {
        &self.tuning
    }

    pub async fn dispatch(&self, command: TransactionCommand) -> Result<Vec<StoredEvent>, DispatchError> {
        let id = command.transaction_id();
        self.dispatcher
            .dispatch(id.0, AGGREGATE_TYPE, command, |id| Transaction::empty(TransactionId(id)))
            .await
    }

    /// Replay the full event log into the read projection.
    pub async fn rebuild_projection(&self) -> Result<usize, ProjectionError> {
        let replayed = self.projection.rebuild_from_store(self.dispatcher.store()).await?;
        info!(replayed, "transaction projection rebuilt");
        Ok(replayed)
    }

    /// Start the outbox pump and the projection consumer.
    pub fn spawn_workers(&self, cancel: &CancellationToken) -> Vec<WorkerHandle> {
        let pump = Arc::new(
            OutboxPump::new(self.outbox.clone(), self.broker.clone(), self.tuning.pump())
                .with_waker(self.waker.clone()),
        );
        let pump_worker = spawn_supervised("outbox-pump", cancel.clone(), WORKER_RESTART_DELAY, move |token| {
            let pump = pump.clone();
            async move { pump.run(&token).await }
        });

        let consumer = Arc::new(StreamConsumer::new(
            self.broker.clone(),
            projection_destination().stream_key(),
            self.tuning.consumer(PROJECTION_GROUP, "projection-worker"),
        ));
        let projection = self.projection.clone();
        let projection_worker = spawn_supervised(
            "transaction-projection",
            cancel.clone(),
            WORKER_RESTART_DELAY,
            move |token| {
                let consumer = consumer.clone();
                let mut handler = ProjectionHandler::new(projection.clone());
                async move { consumer.run(&token, &mut handler).await }
            },
        );

        vec![pump_worker, projection_worker]
    }
}
