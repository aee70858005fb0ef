//! The replication core: policy transform, risk gate, dispatcher, ingress
//! hook and reconciler, assembled as one value-constructed component graph.

pub mod config;
pub mod dispatcher;
pub mod ingress;
pub mod policy;
pub mod reconciler;
pub mod risk;

pub use config::ReplicationConfig;
pub use dispatcher::{DispatchError, Dispatcher};
pub use ingress::IngressHook;
pub use reconciler::Reconciler;
pub use risk::{Decision, ProposedOrder, RiskGate};

use std::sync::Arc;

use tokio::sync::watch;

use crate::api::BrokerAdapter;
use crate::db::{Database, FollowerRegistry};
use crate::events::EventPublisher;
use crate::instruments::InstrumentMapper;
use crate::models::RiskEnvelope;
use crate::session::CredentialVault;

/// The assembled engine. Components are built once at process start and
/// passed explicitly; the only process-wide state lives inside them (the
/// broker semaphore, the HTTP pool, the instrument cache, the session
/// cache).
pub struct Engine {
    pub events: EventPublisher,
    pub ingress: IngressHook,
    pub reconciler: Arc<Reconciler>,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    /// Wire the component graph over an open database and a broker adapter.
    pub fn assemble(
        db: Database,
        vault: Arc<CredentialVault>,
        broker: Arc<dyn BrokerAdapter>,
        config: ReplicationConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = EventPublisher::new();
        let instruments = Arc::new(InstrumentMapper::new(db.clone()));
        let registry = FollowerRegistry::new(db.clone(), config.follower_snapshot_ttl());
        let risk = RiskGate::new(db.clone(), RiskEnvelope::default());

        let dispatcher = Dispatcher::new(
            db.clone(),
            registry,
            instruments.clone(),
            vault.clone(),
            broker.clone(),
            risk,
            events.clone(),
            config.clone(),
            shutdown_rx,
        );
        let ingress = IngressHook::new(db.clone(), dispatcher, events.clone());
        let reconciler = Reconciler::new(db, vault, broker, instruments, events.clone(), config);

        Self {
            events,
            ingress,
            reconciler,
            shutdown_tx,
        }
    }

    /// Subscribe background tasks to the shutdown signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Cooperative shutdown: in-flight pipelines drain, placed orders keep
    /// their last-known status for the reconciler.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
