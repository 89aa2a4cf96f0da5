//! The I/O side of BES transactions.
//!
//! The request descriptors, the error taxonomy and the [`BesClient`] trait
//! live in the leaf `besgate-bes` crate and are re-exported here; this module
//! adds the wire client that actually speaks to a BES listener.

pub use besgate_bes::*;

mod ppt;

pub use ppt::PptClient;
