//! Event clients: subscription setup and per-message dispatch.
//!
//! Two logical clients run against the kernel monitor. The authorizer
//! receives exec events. The tamper-resistance client receives file events
//! only for an enumerated set of watched paths, using inverted muting.
//!
//! For every authorization message the client builds a valve on receipt,
//! arms the emergency timer, and hands the valve to a worker. The timer holds
//! only a weak reference: once the worker has answered and dropped the valve
//! the timer finds nothing to do.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::monitor::{AuthMessage, EventKind, MonitorClient, MonitorError, PathMatch, FILE_EVENT_KINDS};
use crate::valve::AuthorizationValve;

/// Which logical client a monitor connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Process-exec authorization.
    Authorizer,
    /// File-event authorization on watched paths.
    TamperResistance,
}

impl ClientRole {
    /// Event kinds this role subscribes to.
    pub fn subscriptions(self) -> &'static [EventKind] {
        match self {
            Self::Authorizer => &[EventKind::Exec],
            Self::TamperResistance => &FILE_EVENT_KINDS,
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authorizer => f.write_str("authorizer"),
            Self::TamperResistance => f.write_str("tamper_resistance"),
        }
    }
}

/// One event client bound to a monitor connection.
pub struct EventClient {
    role: ClientRole,
    engine: Arc<Engine>,
    monitor: Arc<dyn MonitorClient>,
}

impl fmt::Debug for EventClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventClient")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl EventClient {
    /// Bind `monitor` to `engine` in `role`.
    pub fn new(role: ClientRole, engine: Arc<Engine>, monitor: Arc<dyn MonitorClient>) -> Self {
        Self {
            role,
            engine,
            monitor,
        }
    }

    /// Role served.
    pub fn role(&self) -> ClientRole {
        self.role
    }

    /// Mute ourselves, set up path watching, and subscribe.
    ///
    /// Self-muting is the first call so our own file and exec activity never
    /// reaches the handlers.
    ///
    /// # Errors
    ///
    /// Returns the first monitor call that fails.
    pub fn start(&self) -> Result<(), MonitorError> {
        self.monitor.mute_self()?;

        if self.role == ClientRole::TamperResistance {
            self.monitor.unmute_all_target_paths()?;
            self.monitor.invert_target_path_muting()?;

            let protection = self.engine.protection().config();
            let watched = [
                (&protection.config_file, PathMatch::Literal),
                (&protection.protected_dir, PathMatch::Prefix),
                (&protection.bundle_path, PathMatch::Prefix),
            ];
            for (path, matching) in watched {
                self.monitor
                    .watch_path(&path.to_string_lossy(), matching)?;
            }
            self.engine.attach_tamper_monitor(Arc::clone(&self.monitor));
        }

        self.monitor.subscribe(self.role.subscriptions())?;
        info!(role = %self.role, "event client started");
        Ok(())
    }

    /// Dispatch messages until the channel closes.
    pub async fn run(self, mut messages: mpsc::Receiver<AuthMessage>) {
        while let Some(message) = messages.recv().await {
            self.dispatch(message);
        }
        info!(role = %self.role, "event stream closed");
    }

    /// Dispatch one message to the engine.
    ///
    /// Returns the worker task for authorization messages, `None` for
    /// notify-only ones.
    pub fn dispatch(&self, message: AuthMessage) -> Option<JoinHandle<()>> {
        let engine = Arc::clone(&self.engine);
        self.dispatch_with(message, move |valve| engine.decide(valve))
    }

    /// Dispatch one message, deciding it with `decide` instead of the engine.
    pub fn dispatch_with<F>(&self, message: AuthMessage, decide: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce(&AuthorizationValve) + Send + 'static,
    {
        if !message.is_auth() {
            debug!(
                role = %self.role,
                path = %message.event.primary_path(),
                "notify event, no response owed"
            );
            return None;
        }

        let valve = Arc::new(AuthorizationValve::new(
            Arc::new(message),
            Arc::clone(&self.monitor),
            self.engine.in_flight_counter(),
        ));

        let budget = self
            .engine
            .deadline_policy()
            .processing_budget(valve.message().remaining());
        let timer_valve = Arc::downgrade(&valve);
        tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            if let Some(valve) = timer_valve.upgrade() {
                valve.fire_emergency();
            }
        });

        let engine = Arc::clone(&self.engine);
        let role = self.role;
        Some(tokio::spawn(async move {
            let permit = match engine.acquire_worker().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(role = %role, error = %e, "worker pool closed");
                    return;
                }
            };
            let worker = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                decide(&valve);
            });
            if let Err(e) = worker.await {
                error!(role = %role, error = %e, "decision worker failed");
            }
        }))
    }
}
