//! Authorization valve: exactly one response per kernel message.
//!
//! A valve wraps one [`AuthMessage`] and moves `pending -> responded` once.
//! The decision worker and the emergency deadline timer both hold the valve
//! and race to [`AuthorizationValve::respond`]; the loser finds the flag set
//! and does nothing. A valve dropped while still pending answers ALLOW so no
//! kernel transaction is ever left open.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::monitor::{AuthMessage, AuthResponse, MonitorClient};
use crate::policy::Verdict;

/// How much of the time until the kernel deadline the worker may spend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeadlinePolicy {
    /// Fraction of the remaining time given to the worker (0.0..=1.0).
    pub budget_fraction: f64,
    /// Minimum time reserved for the emergency response.
    pub min_headroom: Duration,
    /// Maximum time reserved for the emergency response.
    pub max_headroom: Duration,
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        Self {
            budget_fraction: 0.8,
            min_headroom: Duration::from_secs(1),
            max_headroom: Duration::from_secs(5),
        }
    }
}

impl DeadlinePolicy {
    /// Delay after which the emergency response fires.
    ///
    /// The raw budget is `budget_fraction` of `remaining`; the headroom left
    /// after it is clamped to `[min_headroom, max_headroom]` and subtracted
    /// from `remaining`.
    pub fn processing_budget(&self, remaining: Duration) -> Duration {
        let fraction = self.budget_fraction.clamp(0.0, 1.0);
        let raw = remaining.mul_f64(fraction);
        let headroom = remaining
            .saturating_sub(raw)
            .clamp(self.min_headroom, self.max_headroom.max(self.min_headroom));
        remaining.saturating_sub(headroom)
    }
}

/// Outcome recorded by the first responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Responder {
    /// The decision worker answered.
    Worker,
    /// The deadline timer answered.
    Deadline,
    /// The valve was dropped while pending.
    Drop,
}

/// One-shot responder for a kernel message.
pub struct AuthorizationValve {
    message: Arc<AuthMessage>,
    client: Arc<dyn MonitorClient>,
    responded: Mutex<Option<Responder>>,
    in_flight: Arc<AtomicUsize>,
}

impl std::fmt::Debug for AuthorizationValve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationValve")
            .field("message_id", &self.message.id)
            .field("responded", &*self.responded.lock())
            .finish()
    }
}

impl AuthorizationValve {
    /// Wrap `message`. Must be called where the message is received so the
    /// message is retained for the valve's whole lifetime.
    ///
    /// `in_flight` is incremented now and decremented on response.
    pub fn new(
        message: Arc<AuthMessage>,
        client: Arc<dyn MonitorClient>,
        in_flight: Arc<AtomicUsize>,
    ) -> Self {
        in_flight.fetch_add(1, Ordering::Relaxed);
        Self {
            message,
            client,
            responded: Mutex::new(None),
            in_flight,
        }
    }

    /// The wrapped message.
    pub fn message(&self) -> &AuthMessage {
        &self.message
    }

    /// Respond as the decision worker.
    ///
    /// Returns `true` when this call sent the response, `false` when the
    /// valve had already responded.
    pub fn respond(&self, verdict: Verdict, cache: bool) -> bool {
        self.respond_as(Responder::Worker, verdict, cache)
    }

    /// Fail open because the processing budget ran out.
    ///
    /// Returns `true` when the timer won the race.
    pub fn fire_emergency(&self) -> bool {
        let won = self.respond_as(Responder::Deadline, Verdict::Allow, false);
        if won {
            error!(
                path = %self.message.event.primary_path(),
                id = self.message.id,
                "deadline reached, forced ALLOW to avoid kernel termination"
            );
        } else {
            debug!(id = self.message.id, "deadline timer found valve already answered");
        }
        won
    }

    /// Who responded, if anyone has.
    pub fn responded_by(&self) -> Option<Responder> {
        *self.responded.lock()
    }

    /// Whether a response has been sent.
    pub fn is_responded(&self) -> bool {
        self.responded.lock().is_some()
    }

    fn respond_as(&self, who: Responder, verdict: Verdict, cache: bool) -> bool {
        {
            let mut responded = self.responded.lock();
            if responded.is_some() {
                return false;
            }
            *responded = Some(who);
        }

        let response = AuthResponse::for_event(&self.message.event, verdict, cache);
        if let Err(e) = self.client.respond(&self.message, response) {
            error!(
                path = %self.message.event.primary_path(),
                id = self.message.id,
                error = %e,
                "monitor respond failed"
            );
        }
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        true
    }
}

impl Drop for AuthorizationValve {
    fn drop(&mut self) {
        if self.responded.get_mut().is_none() {
            warn!(
                path = %self.message.event.primary_path(),
                id = self.message.id,
                "valve dropped without a response, answering ALLOW"
            );
            self.respond_as(Responder::Drop, Verdict::Allow, false);
        }
    }
}
