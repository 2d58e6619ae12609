//! Bridge lifecycle supervisor.
//!
//! Owns every long-lived component and walks them through
//! `Unconfigured → Initialized → Running → Stopping → Stopped`.
//!
//! - **Init** loads the state store and the three registry collections; any
//!   failure aborts with a distinct exit code.
//! - **Start** spawns the application service, event processor, bot profile
//!   sync, user reconnection and the autosave loop. A failing unit is logged
//!   and the rest keep running.
//! - **Stop** runs the shutdown steps in a fixed order. Every step is
//!   attempted even when an earlier one failed, so persisted state is as
//!   fresh as possible.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinSet;

use crate::appservice::AppService;
use crate::autosave::SaveLoop;
use crate::bot_profile::sync_bot_profile;
use crate::config::{AppServiceSettings, Config};
use crate::database::{Database, JsonDatabase};
use crate::error::{BridgeError, InitError, MatrixError, SessionError};
use crate::event_processor::EventProcessor;
use crate::formatter::Formatter;
use crate::handler::MatrixHandler;
use crate::matrix::{HomeserverClient, MatrixClient};
use crate::registry::{Collection, Puppet, Registry, User};
use crate::session::{SessionConnector, UnlinkedConnector};
use crate::state_store::StateStore;

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Unconfigured,
    Initialized,
    Running,
    Stopping,
    Stopped,
}

impl BridgeState {
    /// The only state reachable from `self`.
    pub fn next(self) -> Option<BridgeState> {
        match self {
            BridgeState::Unconfigured => Some(BridgeState::Initialized),
            BridgeState::Initialized => Some(BridgeState::Running),
            BridgeState::Running => Some(BridgeState::Stopping),
            BridgeState::Stopping => Some(BridgeState::Stopped),
            BridgeState::Stopped => None,
        }
    }
}

// ── Collaborators ────────────────────────────────────────────────────────────

/// External collaborators of the bridge, injectable for tests.
pub struct Dependencies {
    pub database: Arc<dyn Database>,
    pub matrix: Arc<dyn MatrixClient>,
    pub connector: Arc<dyn SessionConnector>,
}

impl Dependencies {
    /// Production wiring: JSON files in the data directory, HTTP homeserver
    /// client, and no linked WhatsApp client.
    pub fn from_config(config: &Config, settings: &AppServiceSettings) -> Self {
        Self {
            database: Arc::new(JsonDatabase::new(&config.bridge.data_dir)),
            matrix: Arc::new(HomeserverClient::new(settings)),
            connector: Arc::new(UnlinkedConnector),
        }
    }
}

// ── Shutdown Report ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    StopAutosave,
    StopAppService,
    StopEventProcessor,
    DisconnectUsers,
    SaveStateStore,
    Save(Collection),
}

/// Outcome of every shutdown step, in execution order.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub steps: Vec<(ShutdownStep, Result<(), String>)>,
}

impl ShutdownReport {
    fn record(&mut self, step: ShutdownStep, result: Result<(), BridgeError>) {
        match &result {
            Ok(()) => tracing::debug!(step = ?step, "Shutdown step done"),
            Err(e) => tracing::error!(step = ?step, error = %e, "Shutdown step failed"),
        }
        self.steps.push((step, result.map_err(|e| e.to_string())));
    }

    pub fn attempted(&self) -> Vec<ShutdownStep> {
        self.steps.iter().map(|(step, _)| *step).collect()
    }

    pub fn failures(&self) -> Vec<ShutdownStep> {
        self.steps
            .iter()
            .filter(|(_, result)| result.is_err())
            .map(|(step, _)| *step)
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|(_, result)| result.is_ok())
    }
}

// ── Bridge ───────────────────────────────────────────────────────────────────

pub struct Bridge {
    state: BridgeState,
    config: Arc<Config>,
    registry: Arc<Registry>,
    state_store: Arc<StateStore>,
    deps: Dependencies,
    appservice: AppService,
    event_processor: EventProcessor,
    formatter: Formatter,
    save_loop: Option<SaveLoop>,
    /// Profile sync, reconnects and custom puppet checks spawned by `start`.
    startup_tasks: JoinSet<()>,
}

impl Bridge {
    /// Load persisted state and wire the components together. Nothing is
    /// started yet.
    pub fn init(
        config: Config,
        settings: AppServiceSettings,
        deps: Dependencies,
    ) -> Result<Self, InitError> {
        let config = Arc::new(config);

        tracing::debug!("Initializing state store");
        let state_store = Arc::new(StateStore::new(&config.appservice.state_store_path));
        state_store.load().map_err(InitError::StateStore)?;

        tracing::debug!("Initializing database");
        let registry = Arc::new(Registry::new());
        registry
            .load_users(deps.database.as_ref())
            .map_err(InitError::Users)?;
        registry
            .load_portals(deps.database.as_ref())
            .map_err(InitError::Portals)?;
        registry
            .load_puppets(deps.database.as_ref())
            .map_err(InitError::Puppets)?;

        tracing::debug!("Initializing Matrix event processor");
        let handler = Arc::new(MatrixHandler::new(
            Arc::clone(&registry),
            Arc::clone(&state_store),
            Arc::clone(&deps.matrix),
            config.bot_mxid(),
        ));
        let event_processor = EventProcessor::new(handler);
        let appservice = AppService::new(settings, event_processor.sender());
        let formatter = Formatter::new(Arc::clone(&config));

        tracing::info!(
            users = registry.user_count(),
            portals = registry.portal_count(),
            puppets = registry.puppet_count(),
            "Bridge initialized"
        );

        Ok(Self {
            state: BridgeState::Initialized,
            config,
            registry,
            state_store,
            deps,
            appservice,
            event_processor,
            formatter,
            save_loop: None,
            startup_tasks: JoinSet::new(),
        })
    }

    fn advance(&mut self, to: BridgeState) -> Result<(), BridgeError> {
        if self.state.next() != Some(to) {
            return Err(BridgeError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        tracing::debug!(from = ?self.state, to = ?to, "Bridge state change");
        self.state = to;
        Ok(())
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn state_store(&self) -> &Arc<StateStore> {
        &self.state_store
    }

    pub fn formatter(&self) -> &Formatter {
        &self.formatter
    }

    /// Address the application service listens on while running.
    pub fn appservice_addr(&self) -> Option<SocketAddr> {
        self.appservice.local_addr()
    }

    /// Start every runtime unit. Units do not wait for each other, and a
    /// failure in one is logged without affecting the rest.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        self.advance(BridgeState::Running)?;

        tracing::debug!("Starting application service HTTP server");
        if let Err(e) = self.appservice.start().await {
            tracing::error!(error = %e, "Application service failed to start");
        }

        tracing::debug!("Starting event processor");
        if let Err(e) = self.event_processor.start() {
            tracing::error!(error = %e, "Event processor failed to start");
        }

        let matrix = Arc::clone(&self.deps.matrix);
        let config = Arc::clone(&self.config);
        self.startup_tasks.spawn(async move {
            sync_bot_profile(matrix.as_ref(), &config.appservice.bot).await;
        });

        self.start_users();

        self.save_loop = Some(SaveLoop::spawn(
            Arc::clone(&self.registry),
            Arc::clone(&self.state_store),
            Arc::clone(&self.deps.database),
            Duration::from_secs(self.config.bridge.autosave_interval_secs),
        ));

        tracing::info!("Bridge started");
        Ok(())
    }

    /// Reconnect every user with a stored session and verify every custom
    /// puppet. Each runs in its own task.
    fn start_users(&mut self) {
        tracing::debug!("Starting users");
        for user in self.registry.all_users() {
            let registry = Arc::clone(&self.registry);
            let connector = Arc::clone(&self.deps.connector);
            self.startup_tasks.spawn(async move {
                connect_user(&registry, connector.as_ref(), &user).await;
            });
        }

        tracing::debug!("Starting custom puppets");
        for puppet in self.registry.all_puppets_with_custom_mxid() {
            let matrix = Arc::clone(&self.deps.matrix);
            self.startup_tasks.spawn(async move {
                if let Err(e) = start_custom_puppet(matrix.as_ref(), &puppet).await {
                    tracing::error!(puppet = %puppet.jid, error = %e, "Failed to start custom puppet");
                }
            });
        }
    }

    /// Run the ordered shutdown. Every step is attempted; the report says
    /// which ones failed.
    pub async fn stop(&mut self) -> Result<ShutdownReport, BridgeError> {
        self.advance(BridgeState::Stopping)?;
        let mut report = ShutdownReport::default();

        tracing::debug!("Stopping autosave loop");
        let result = match self.save_loop.take() {
            Some(save_loop) => save_loop.stop().await,
            None => Err(BridgeError::NotRunning("autosave loop")),
        };
        report.record(ShutdownStep::StopAutosave, result);

        tracing::debug!("Stopping application service");
        report.record(ShutdownStep::StopAppService, self.appservice.stop().await);

        tracing::debug!("Stopping event processor");
        report.record(
            ShutdownStep::StopEventProcessor,
            self.event_processor.stop().await,
        );

        tracing::debug!("Disconnecting users");
        report.record(ShutdownStep::DisconnectUsers, self.disconnect_users().await);

        tracing::debug!("Saving state store");
        report.record(
            ShutdownStep::SaveStateStore,
            self.state_store.save().map_err(BridgeError::from),
        );

        for collection in Collection::ALL {
            tracing::debug!(collection = collection.name(), "Saving collection");
            let result = self
                .registry
                .save(collection, self.deps.database.as_ref())
                .map(|count| tracing::info!(collection = collection.name(), count, "Saved"))
                .map_err(BridgeError::from);
            report.record(ShutdownStep::Save(collection), result);
        }

        self.advance(BridgeState::Stopped)?;
        Ok(report)
    }

    /// Disconnect every connected user concurrently, each bounded by the
    /// configured timeout. Startup tasks are settled first so no connection
    /// can attach after the connected set is taken.
    async fn disconnect_users(&mut self) -> Result<(), BridgeError> {
        let timeout = Duration::from_secs(self.config.bridge.disconnect_timeout_secs);
        self.settle_startup_tasks(timeout).await;

        let users = self.registry.connected_users();
        let total = users.len();

        let results = join_all(
            users
                .iter()
                .map(|user| disconnect_user(&self.registry, user, timeout)),
        )
        .await;

        let failed = results.into_iter().filter(|ok| !ok).count();
        if failed > 0 {
            return Err(BridgeError::Disconnect { failed, total });
        }
        Ok(())
    }

    /// Give in-flight startup tasks up to `timeout` to finish, then abort
    /// the rest and wait for them to unwind.
    async fn settle_startup_tasks(&mut self, timeout: Duration) {
        let tasks = &mut self.startup_tasks;
        let drain = async move { while tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            tracing::warn!(
                pending = self.startup_tasks.len(),
                "Startup tasks still running, aborting them"
            );
            self.startup_tasks.shutdown().await;
        }
    }

    /// Start, wait for `shutdown` to resolve, then stop.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<ShutdownReport, BridgeError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        tracing::info!("Stopping bridge");
        let report = self.stop().await?;
        tracing::info!(clean = report.is_clean(), "Bridge stopped");
        Ok(report)
    }
}

// ── Per-entity Tasks ─────────────────────────────────────────────────────────

async fn connect_user(registry: &Registry, connector: &dyn SessionConnector, user: &User) {
    let Some(session) = user.session() else {
        tracing::debug!(user = %user.mxid, "Not logged in, skipping");
        return;
    };

    tracing::debug!(user = %user.mxid, "Connecting");
    let connection = match connector.connect(&user.mxid, session).await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::error!(user = %user.mxid, error = %e, "Failed to connect");
            return;
        }
    };

    let jid = connection.jid.clone();
    let remote = Arc::clone(&connection.session);
    match registry.attach_connection(&user.mxid, connection) {
        Ok(()) => tracing::info!(user = %user.mxid, jid = %jid, "Connected"),
        Err(e) => {
            tracing::error!(user = %user.mxid, error = %e, "Rejecting connection");
            if let Err(e) = remote.disconnect().await {
                tracing::warn!(user = %user.mxid, error = %e, "Failed to close rejected connection");
            }
        }
    }
}

async fn start_custom_puppet(matrix: &dyn MatrixClient, puppet: &Puppet) -> Result<(), MatrixError> {
    let (Some(expected), Some(token)) = (puppet.custom_mxid(), puppet.access_token()) else {
        return Ok(());
    };
    let actual = matrix.whoami(&token).await?;
    if actual != expected {
        return Err(MatrixError::UserMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    tracing::debug!(puppet = %puppet.jid, mxid = %expected, "Custom puppet started");
    Ok(())
}

/// Disconnect one user, storing the returned session. Returns false when the
/// disconnect failed or timed out; the connection is detached either way.
async fn disconnect_user(registry: &Registry, user: &User, timeout: Duration) -> bool {
    let Some(remote) = user.connection() else {
        return true;
    };

    let result = match tokio::time::timeout(timeout, remote.disconnect()).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::Timeout(timeout.as_secs())),
    };

    let (session, ok) = match result {
        Ok(session) => (Some(session), true),
        Err(e) => {
            tracing::error!(user = %user.mxid, error = %e, "Error while disconnecting");
            (None, false)
        }
    };
    if let Err(e) = registry.detach_connection(&user.mxid, session) {
        tracing::error!(user = %user.mxid, error = %e, "Failed to store session");
        return false;
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_advance_one_step_at_a_time() {
        let mut state = BridgeState::Unconfigured;
        let mut seen = vec![state];
        while let Some(next) = state.next() {
            state = next;
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                BridgeState::Unconfigured,
                BridgeState::Initialized,
                BridgeState::Running,
                BridgeState::Stopping,
                BridgeState::Stopped,
            ]
        );
    }

    #[test]
    fn test_report_tracks_failures() {
        let mut report = ShutdownReport::default();
        report.record(ShutdownStep::StopAutosave, Ok(()));
        report.record(
            ShutdownStep::DisconnectUsers,
            Err(BridgeError::Disconnect { failed: 1, total: 3 }),
        );
        assert_eq!(
            report.attempted(),
            vec![ShutdownStep::StopAutosave, ShutdownStep::DisconnectUsers]
        );
        assert_eq!(report.failures(), vec![ShutdownStep::DisconnectUsers]);
        assert!(!report.is_clean());
    }
}
