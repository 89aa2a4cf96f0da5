//! Asynchronous fulfillment of slow data requests.
//!
//! Some backend transactions take longer than a client is willing to keep a
//! connection open. The DAP4 asynchronous-response protocol lets the client
//! declare up front how long it will wait; the server either answers
//! immediately, or accepts the request and hands back a link to poll until
//! the result is due.
//!
//! The flow per resource is a small state machine:
//!
//! ```text
//! no signal ----------------------> REQUIRED   (client must opt in)
//! signal too short ---------------> REJECTED
//! signal ok, unknown resource ----> ACCEPTED   (entry created, poll link)
//! known, before ready time -------> PENDING
//! known, ready and unexpired -----> READY      (execute now, return data)
//! known, past expiry -------------> GONE       (entry removed)
//! ```
//!
//! [`negotiate`] handles the first two rows from the client's delay signals
//! alone; [`AsyncCompletionTracker::evaluate`] runs the whole table. Pending
//! entries live in a single mutex-guarded map keyed by the canonical resource
//! identity, mirroring the cache layer's one-lock discipline.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::bes::{BesClient, BesCommand, BesError, BesPayload};
use crate::config::DeferredConfig;

pub mod dap2;

/// Server-side policy for deferred responses, fixed for the process lifetime.
#[derive(Clone, Debug)]
pub struct DeferredPolicy {
    /// How long after acceptance a result becomes available.
    pub expected_delay: Duration,
    /// How long past readiness the result can still be collected.
    pub result_lifetime: Duration,
    /// Longest a request worker will block executing a due request before
    /// giving up and reporting the result as still pending.
    pub ready_wait_ceiling: Duration,
    /// When false, the pending and gone states degrade to a bare
    /// "unavailable" answer for clients that predate those responses.
    pub use_pending_and_gone: bool,
}

impl From<&DeferredConfig> for DeferredPolicy {
    fn from(config: &DeferredConfig) -> Self {
        DeferredPolicy {
            expected_delay: config.response_delay,
            result_lifetime: config.result_lifetime,
            ready_wait_ceiling: config.ready_wait_ceiling,
            use_pending_and_gone: config.use_pending_and_gone,
        }
    }
}

/// The client's raw delay-acceptance signals, still unparsed.
///
/// The `async` query parameter and the `X-DAP-Async-Accept` header both carry
/// a number of seconds. The query parameter wins when both parse; a value
/// that does not parse is logged and treated as absent rather than failing
/// the request.
#[derive(Clone, Debug, Default)]
pub struct DelaySignals {
    /// First value of the `async` query parameter, if present.
    pub query: Option<String>,
    /// First value of the `X-DAP-Async-Accept` header, if present.
    pub header: Option<String>,
}

impl DelaySignals {
    fn parse(source: &str, raw: &str) -> Option<Duration> {
        match raw.trim().parse::<u64>() {
            Ok(seconds) => Some(Duration::from_secs(seconds)),
            Err(error) => {
                tracing::warn!(source, raw, %error, "ignoring unparseable delay signal");
                None
            }
        }
    }

    /// The delay the client will accept, or `None` when no usable signal is
    /// present.
    pub fn accepted_delay(&self) -> Option<Duration> {
        let query = self.query.as_deref().and_then(|v| Self::parse("query", v));
        let header = self
            .header
            .as_deref()
            .and_then(|v| Self::parse("header", v));
        query.or(header)
    }
}

/// Why a request was rejected during delay negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectionReason {
    /// The delay the client accepts is shorter than the expected delay.
    Time,
}

/// Outcome of delay negotiation alone, before any tracker state is consulted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DelayDecision {
    /// No usable signal; the client must opt in to a deferred response.
    Required,
    /// The client's accepted delay is too short.
    Rejected {
        reason: RejectionReason,
        description: String,
    },
    /// The client accepts at least the expected delay.
    Acceptable(Duration),
}

/// Compares the client's delay signals against server policy.
pub fn negotiate(signals: &DelaySignals, policy: &DeferredPolicy) -> DelayDecision {
    match signals.accepted_delay() {
        None => DelayDecision::Required,
        Some(accepted) if accepted < policy.expected_delay => DelayDecision::Rejected {
            reason: RejectionReason::Time,
            description: "Acceptable access delay was less than estimated delay.".to_owned(),
        },
        Some(accepted) => DelayDecision::Acceptable(accepted),
    }
}

/// What the routing layer should tell the client.
///
/// The transport mapping of [`http_status_hint`](Self::http_status_hint) is a
/// suggestion; this layer only produces structured values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeferredOutcome {
    /// The client gave no delay signal and must do so to get the resource.
    Required {
        expected_delay: Duration,
        result_lifetime: Duration,
    },
    /// The client's accepted delay is shorter than the expected delay.
    Rejected {
        reason: RejectionReason,
        description: String,
    },
    /// The request was queued; poll the link after the expected delay.
    Accepted {
        poll_link: String,
        expected_delay: Duration,
        result_lifetime: Duration,
    },
    /// The result is not ready yet; retry later.
    Pending,
    /// The result is due and was produced.
    Ready(BesPayload),
    /// The result expired before the client collected it.
    Gone,
    /// Pending or expired, reported opaquely for clients that cannot handle
    /// the dedicated responses.
    Unavailable,
}

impl DeferredOutcome {
    /// Suggested HTTP status for this outcome.
    pub fn http_status_hint(&self) -> u16 {
        match self {
            DeferredOutcome::Required { .. } => 400,
            DeferredOutcome::Rejected { .. } => 412,
            DeferredOutcome::Accepted { .. } => 202,
            DeferredOutcome::Pending => 409,
            DeferredOutcome::Ready(_) => 200,
            DeferredOutcome::Gone => 410,
            DeferredOutcome::Unavailable => 404,
        }
    }
}

struct PendingResult {
    ready_at: Instant,
    expires_at: Instant,
}

enum Phase {
    Accepted,
    NotYetReady,
    Ready,
    Expired,
}

/// Tracks accepted-but-not-yet-delivered results.
pub struct AsyncCompletionTracker {
    policy: DeferredPolicy,
    pending: Mutex<HashMap<String, PendingResult>>,
}

impl AsyncCompletionTracker {
    pub fn new(policy: DeferredPolicy) -> Self {
        AsyncCompletionTracker {
            policy,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// The policy this tracker enforces.
    pub fn policy(&self) -> &DeferredPolicy {
        &self.policy
    }

    /// Runs the full decision table for one request.
    ///
    /// `resource_key` is the canonical identity of "this resource with these
    /// parameters", excluding the delay-acceptance signal itself, so polls for
    /// the same data always land on the same entry. `poll_link` is the URL
    /// the client should come back to; the routing layer constructs it.
    ///
    /// A due request executes synchronously on the caller, bounded by the
    /// policy's ready-wait ceiling; hitting the ceiling reports the result as
    /// still pending and keeps the entry. A backend failure during that
    /// execution removes the entry so the client's retry starts clean, and
    /// propagates as an error.
    pub async fn evaluate(
        &self,
        resource_key: &str,
        command: &BesCommand,
        signals: &DelaySignals,
        poll_link: &str,
        bes: &dyn BesClient,
    ) -> Result<DeferredOutcome, BesError> {
        match negotiate(signals, &self.policy) {
            DelayDecision::Required => {
                return Ok(DeferredOutcome::Required {
                    expected_delay: self.policy.expected_delay,
                    result_lifetime: self.policy.result_lifetime,
                });
            }
            DelayDecision::Rejected {
                reason,
                description,
            } => {
                return Ok(DeferredOutcome::Rejected {
                    reason,
                    description,
                });
            }
            DelayDecision::Acceptable(accepted) => {
                tracing::debug!(
                    resource = resource_key,
                    accepted = accepted.as_secs(),
                    "client accepts deferred response"
                );
            }
        }

        let now = Instant::now();

        // Classify under the lock, then execute due requests outside it so a
        // slow backend call never blocks unrelated evaluations.
        let phase = {
            let mut pending = self.pending.lock().unwrap();
            let phase = match pending.get(resource_key) {
                None => {
                    let ready_at = now + self.policy.expected_delay;
                    pending.insert(
                        resource_key.to_owned(),
                        PendingResult {
                            ready_at,
                            expires_at: ready_at + self.policy.result_lifetime,
                        },
                    );
                    Phase::Accepted
                }
                Some(entry) if now < entry.ready_at => Phase::NotYetReady,
                Some(entry) if now < entry.expires_at => Phase::Ready,
                Some(_) => {
                    pending.remove(resource_key);
                    Phase::Expired
                }
            };
            // Expired entries for keys nobody polls again must not pile up
            // for the process lifetime. The polled key was already classified,
            // so it still reports GONE once before disappearing.
            pending.retain(|_, entry| now < entry.expires_at);
            phase
        };

        match phase {
            Phase::Accepted => {
                tracing::info!(resource = resource_key, "accepted deferred request");
                Ok(DeferredOutcome::Accepted {
                    poll_link: poll_link.to_owned(),
                    expected_delay: self.policy.expected_delay,
                    result_lifetime: self.policy.result_lifetime,
                })
            }
            Phase::NotYetReady => Ok(if self.policy.use_pending_and_gone {
                DeferredOutcome::Pending
            } else {
                DeferredOutcome::Unavailable
            }),
            Phase::Expired => {
                tracing::info!(resource = resource_key, "deferred result expired");
                Ok(if self.policy.use_pending_and_gone {
                    DeferredOutcome::Gone
                } else {
                    DeferredOutcome::Unavailable
                })
            }
            Phase::Ready => self.execute_due(resource_key, command, bes).await,
        }
    }

    /// Executes a due request, collapsing DAP4 descriptors for the DAP2
    /// execution path.
    ///
    /// The entry stays in the tracker on success so the client can poll the
    /// result again until it expires.
    async fn execute_due(
        &self,
        resource_key: &str,
        command: &BesCommand,
        bes: &dyn BesClient,
    ) -> Result<DeferredOutcome, BesError> {
        let command = dap2::to_dap2(command);

        match tokio::time::timeout(self.policy.ready_wait_ceiling, bes.transaction(&command)).await
        {
            Ok(Ok(payload)) => {
                tracing::info!(resource = resource_key, "delivered deferred result");
                Ok(DeferredOutcome::Ready(payload))
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    resource = resource_key,
                    error = %error,
                    "deferred execution failed; dropping tracker entry"
                );
                self.pending.lock().unwrap().remove(resource_key);
                Err(error)
            }
            Err(_) => {
                tracing::warn!(
                    resource = resource_key,
                    ceiling = self.policy.ready_wait_ceiling.as_secs(),
                    "deferred execution exceeded the ready-wait ceiling"
                );
                Ok(if self.policy.use_pending_and_gone {
                    DeferredOutcome::Pending
                } else {
                    DeferredOutcome::Unavailable
                })
            }
        }
    }

    /// Number of tracked pending results.
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
