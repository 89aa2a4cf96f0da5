//! Besgate.
//!
//! Besgate is a standalone web gateway in front of a Backend Execution
//! Service (BES). It serves OPeNDAP catalog and data requests over HTTP,
//! caches catalog transactions with recency-based eviction and background
//! refresh, and negotiates asynchronous fulfillment for data requests that
//! take longer than the client is willing to wait.

#![warn(missing_docs, missing_debug_implementations, clippy::all)]

#[macro_use]
mod metrics;

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;
mod service;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
