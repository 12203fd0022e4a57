//! Media reconciliation library - shared modules for all binaries.
//!
//! Pipeline order: [`scan`] and [`store`] read an export, [`typedstream`]
//! decodes message bodies, [`matcher`] pairs by timestamp, [`dedup`] collapses
//! identical bytes, [`ledger`] keeps what could not be resolved and
//! [`coordinator`] drives all of it.

pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod hashing;
pub mod ledger;
pub mod matcher;
pub mod models;
pub mod progress;
pub mod safety;
pub mod scan;
pub mod sink;
pub mod store;
pub mod typedstream;
