//! Helpers for testing besgate crates.
//!
//! Provides logging setup and a scriptable in-memory backend so tests never
//! need a live BES listener.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use besgate_bes::{BesClient, BesCommand, BesError, BesPayload};

/// Setup function for all tests.
///
/// Initializes logging to stdout so `tracing` output from the code under
/// test is visible when a test fails. Safe to call from every test; only the
/// first call installs the subscriber.
pub fn setup() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("besgate=trace,besgate_service=trace")
        .try_init()
        .ok();
}

type Scripted = Result<String, BesError>;

/// A [`BesClient`] that answers from a script instead of a live backend.
///
/// Responses can be scripted per resource or as a blanket default; lookups
/// prefer the per-resource entry. An unscripted resource fails the
/// transaction, which keeps tests honest about what they exercise.
#[derive(Default)]
pub struct ScriptedBes {
    by_resource: Mutex<HashMap<String, Scripted>>,
    fallback: Mutex<Option<Scripted>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl ScriptedBes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts a successful payload for one resource.
    pub fn respond(self, resource: &str, text: &str) -> Self {
        self.by_resource
            .lock()
            .unwrap()
            .insert(resource.to_owned(), Ok(text.to_owned()));
        self
    }

    /// Scripts a backend error for one resource.
    pub fn fail(self, resource: &str, error: BesError) -> Self {
        self.by_resource
            .lock()
            .unwrap()
            .insert(resource.to_owned(), Err(error));
        self
    }

    /// Scripts a successful payload for every resource without its own entry.
    pub fn respond_all(self, text: &str) -> Self {
        *self.fallback.lock().unwrap() = Some(Ok(text.to_owned()));
        self
    }

    /// Scripts a backend error for every resource without its own entry.
    pub fn fail_all(self, error: BesError) -> Self {
        *self.fallback.lock().unwrap() = Some(Err(error));
        self
    }

    /// Makes every transaction take `delay` of (tokio) time. Pairs with
    /// `start_paused` tests that advance the clock.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    /// Number of transactions executed so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Resources seen, in transaction order.
    pub fn seen_resources(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl BesClient for ScriptedBes {
    async fn transaction(&self, command: &BesCommand) -> Result<BesPayload, BesError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(command.resource.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .by_resource
            .lock()
            .unwrap()
            .get(&command.resource)
            .cloned()
            .or_else(|| self.fallback.lock().unwrap().clone());

        match scripted {
            Some(Ok(text)) => Ok(BesPayload(text)),
            Some(Err(error)) => Err(error),
            None => Err(BesError::NotFound(format!(
                "no scripted response for {}",
                command.resource
            ))),
        }
    }
}
