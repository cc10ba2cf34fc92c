//! The `utils` module holds the pieces every adapter shares: the error
//! taxonomy, logging initialisation and the metrics registry.

pub mod error;
pub mod logging;
pub mod metrics;
