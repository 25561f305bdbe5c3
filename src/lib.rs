//! Core library for the italia-opendata command line application.
//!
//! The library builds a local, offline copy of the Italian administrative
//! hierarchy (regions, provinces, municipalities) from official and community
//! open data, and answers lookups against it. Provider adapters live under
//! [`italia::opendata::sources`], key normalisation in
//! [`italia::opendata::reconcile`], the join logic in [`italia::opendata::merge`],
//! persistence in [`italia::opendata::store`], lookups in
//! [`italia::opendata::query`], and refresh orchestration under
//! [`italia::opendata::sync`].

pub mod italia;

pub use italia::opendata::{
    DatasetError, FetchError, Result, config, error, logging, merge, model, normalise, query,
    reconcile, sources, store, sync,
};
pub use italia::opendata::config::Config;
pub use italia::opendata::sync::{DatasetManager, DatasetStatus, RefreshOutcome, StoreState};
