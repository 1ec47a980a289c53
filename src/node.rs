//! Node runtime
//!
//! Wires one front-end node together.
//!
//! ## Startup
//! 1. Validate config, connect the shared store
//! 2. Open the durable backend; warm the store from snapshots if it is cold
//! 3. Start the snapshot mirror
//! 4. Load the projection from the store
//! 5. Subscribe the projection to the event bus, and message listeners to
//!    the message topic
//! 6. Start the periodic resync thread
//!
//! ## Shutdown
//! Stops the resync thread and the bus subscribers, then drains the mirror.
//!
//! ## Settings
//! Player settings live in the durable backend. Without one, every setting
//! reads as enabled and cannot be changed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::bus::{BusSubscription, EventBus, PARTY_EVENTS, PARTY_MESSAGES};
use crate::clock::{system_clock, SharedClock};
use crate::config::{Config, StoreBackend};
use crate::coordinator::Coordinator;
use crate::durable::{self, warm_start, DurableStore, SnapshotMirror, SqlExecutor, WarmStart};
use crate::error::{PartyError, Result};
use crate::model::{Party, PartyEvent, PartyMessage, PlayerId, PlayerSetting};
use crate::presence::Presence;
use crate::projection::Projection;
use crate::retry::sleep_unless;
use crate::store::{MemoryStore, RemoteStore, SharedStore};

/// Callback for party messages delivered to this node
pub type MessageListener = Box<dyn Fn(&PartyMessage) + Send + Sync>;

/// Assembles a [`Node`], overriding parts that would come from config
pub struct NodeBuilder {
    config: Config,
    store: Option<Arc<dyn SharedStore>>,
    durable: Option<Arc<dyn DurableStore>>,
    sql_executor: Option<Box<dyn SqlExecutor>>,
    clock: Option<SharedClock>,
}

impl NodeBuilder {
    /// Use this store instead of the configured one
    pub fn store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this durable backend instead of the configured one
    pub fn durable(mut self, durable: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Driver for a configured MySQL, MariaDB or Postgres backend
    pub fn sql_executor(mut self, executor: Box<dyn SqlExecutor>) -> Self {
        self.sql_executor = Some(executor);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn start(self) -> Result<Node> {
        Node::assemble(self)
    }
}

/// A running front-end node
pub struct Node {
    config: Config,
    store: Arc<dyn SharedStore>,
    coordinator: Arc<Coordinator>,
    projection: Arc<Projection>,
    presence: Presence,
    durable: Option<Arc<dyn DurableStore>>,
    mirror: Option<Arc<SnapshotMirror>>,
    warm_start: WarmStart,

    subscription: Mutex<Option<BusSubscription>>,
    message_listeners: Arc<RwLock<Vec<MessageListener>>>,
    message_subscription: Mutex<Option<BusSubscription>>,
    resync_stop: Arc<AtomicBool>,
    resync_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn builder(config: Config) -> NodeBuilder {
        NodeBuilder {
            config,
            store: None,
            durable: None,
            sql_executor: None,
            clock: None,
        }
    }

    /// Start a node entirely from `config`
    pub fn start(config: Config) -> Result<Self> {
        Self::builder(config).start()
    }

    fn assemble(builder: NodeBuilder) -> Result<Self> {
        let NodeBuilder {
            config,
            store,
            durable,
            sql_executor,
            clock,
        } = builder;
        config.validate()?;
        let clock = clock.unwrap_or_else(system_clock);

        tracing::info!("Starting node {}", config.node_id);

        // Step 1: Shared store
        let store: Arc<dyn SharedStore> = match store {
            Some(store) => store,
            None => match &config.store {
                StoreBackend::Memory => Arc::new(MemoryStore::with_clock(Arc::clone(&clock))),
                StoreBackend::Remote { addr } => {
                    Arc::new(RemoteStore::connect(addr, config.store_timeout())?)
                }
            },
        };

        // Step 2: Durable backend and warm start
        let durable = match durable {
            Some(durable) => Some(durable),
            None => durable::open_durable(&config, sql_executor)?,
        };
        let warm = match &durable {
            Some(durable) => warm_start(store.as_ref(), durable.as_ref())?,
            None => WarmStart::default(),
        };

        // Step 3: Mirror
        let mirror = match &durable {
            Some(durable) => Some(Arc::new(SnapshotMirror::start(
                Arc::clone(durable),
                config.mirror_batch_size,
            )?)),
            None => None,
        };

        // Step 4: Projection and coordinator
        let projection = Arc::new(Projection::new(config.projection_ttl(), Arc::clone(&clock)));
        if let Err(e) = projection.resync(store.as_ref()) {
            tracing::warn!("Initial projection load failed: {}", e);
        }

        let bus = EventBus::new(Arc::clone(&store)).with_backoff(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        );
        let mut coordinator = Coordinator::new(Arc::clone(&store), &config)
            .with_bus(bus.clone())
            .with_projection(Arc::clone(&projection))
            .with_clock(Arc::clone(&clock));
        if let Some(mirror) = &mirror {
            coordinator = coordinator.with_mirror(Arc::clone(mirror));
        }
        let coordinator = Arc::new(coordinator);

        // Step 5: Bus subscription
        let node_id = config.node_id.clone();
        let apply_to = Arc::clone(&projection);
        let heal = Arc::clone(&projection);
        let heal_store = Arc::clone(&store);
        let subscription = bus.subscribe(
            PARTY_EVENTS,
            move |event: PartyEvent| {
                // Own commits were applied before publishing
                if event.origin != node_id {
                    apply_to.apply(&event);
                }
            },
            move || match heal.resync(heal_store.as_ref()) {
                Ok(parties) => tracing::info!("Resynced {} parties after bus gap", parties),
                Err(e) => tracing::warn!("Resync after bus gap failed: {}", e),
            },
        )?;

        let message_listeners: Arc<RwLock<Vec<MessageListener>>> = Arc::new(RwLock::new(Vec::new()));
        let deliver_to = Arc::clone(&message_listeners);
        let message_subscription = bus.subscribe(
            PARTY_MESSAGES,
            move |message: PartyMessage| {
                for listener in deliver_to.read().iter() {
                    listener(&message);
                }
            },
            || tracing::debug!("Party messages sent during the gap are lost"),
        )?;

        // Step 6: Periodic resync
        let resync_stop = Arc::new(AtomicBool::new(false));
        let resync_thread = spawn_resync(
            Arc::clone(&projection),
            Arc::clone(&store),
            config.resync_interval(),
            Arc::clone(&resync_stop),
        )?;

        let presence = Presence::new(Arc::clone(&coordinator), clock);

        tracing::info!(
            "Node {} ready ({} parties restored from snapshots)",
            config.node_id,
            warm.restored
        );

        Ok(Self {
            config,
            store,
            coordinator,
            projection,
            presence,
            durable,
            mirror,
            warm_start: warm,
            subscription: Mutex::new(Some(subscription)),
            message_listeners,
            message_subscription: Mutex::new(Some(message_subscription)),
            resync_stop,
            resync_thread: Mutex::new(Some(resync_thread)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn projection(&self) -> &Arc<Projection> {
        &self.projection
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn mirror(&self) -> Option<&Arc<SnapshotMirror>> {
        self.mirror.as_ref()
    }

    /// What startup reconciliation did
    pub fn warm_start_report(&self) -> WarmStart {
        self.warm_start
    }

    /// Whether the bus subscription is currently established
    pub fn bus_connected(&self) -> bool {
        self.subscription
            .lock()
            .as_ref()
            .map_or(false, BusSubscription::is_connected)
    }

    /// Receive every party message published on the bus
    ///
    /// Listeners run on the subscriber thread and see messages for all
    /// parties; [`PartyMessage::is_for`] picks out local recipients.
    pub fn add_message_listener(&self, listener: MessageListener) {
        self.message_listeners.write().push(listener);
    }

    /// Current value of `setting` for `player`
    pub fn setting(&self, player: PlayerId, setting: PlayerSetting) -> Result<bool> {
        match &self.durable {
            Some(durable) => durable.setting(player, setting),
            None => Ok(true),
        }
    }

    /// Flip `setting` for `player`; returns the new value
    pub fn toggle_setting(&self, player: PlayerId, setting: PlayerSetting) -> Result<bool> {
        let durable = self.durable.as_ref().ok_or_else(|| {
            PartyError::Config("player settings need a durable backend".to_string())
        })?;
        let enabled = !durable.setting(player, setting)?;
        durable.set_setting(player, setting, enabled)?;
        tracing::debug!("{} {} for {}", setting, if enabled { "enabled" } else { "disabled" }, player);
        Ok(enabled)
    }

    /// Members of `party` who want notices about it, in member order
    pub fn notification_recipients(&self, party: &Party) -> Result<Vec<PlayerId>> {
        match &self.durable {
            Some(durable) => durable.players_with_setting(&party.members, PlayerSetting::Notifications),
            None => Ok(party.members.clone()),
        }
    }

    /// Rebuild the projection from the store now
    pub fn resync_now(&self) -> Result<usize> {
        self.projection.resync(self.store.as_ref())
    }

    /// Stop background threads and drain the mirror
    pub fn shutdown(&self) {
        self.resync_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.resync_thread.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("Resync thread panicked");
            }
        }
        if let Some(mut subscription) = self.subscription.lock().take() {
            subscription.stop();
        }
        if let Some(mut subscription) = self.message_subscription.lock().take() {
            subscription.stop();
        }
        if let Some(mirror) = &self.mirror {
            mirror.flush();
            mirror.shutdown();
        }
        tracing::info!("Node {} stopped", self.config.node_id);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if !self.resync_stop.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

fn spawn_resync(
    projection: Arc<Projection>,
    store: Arc<dyn SharedStore>,
    interval: Duration,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("projection-resync".to_string())
        .spawn(move || loop {
            sleep_unless(interval, || stop.load(Ordering::SeqCst));
            if stop.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = projection.resync(store.as_ref()) {
                tracing::warn!("Periodic resync failed: {}", e);
            }
        })?;
    Ok(handle)
}
