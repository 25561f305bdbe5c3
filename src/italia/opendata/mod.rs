pub mod config;
pub mod error;
pub mod logging;
pub mod merge;
pub mod model;
pub mod normalise;
pub mod query;
pub mod reconcile;
pub mod sources;
pub mod store;
pub mod sync;

pub use error::{DatasetError, FetchError, Result};
