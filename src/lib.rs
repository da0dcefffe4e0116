//! doc_bootstrap: idempotent provisioning of document-database users,
//! collections and indexes from a declarative manifest.
//!
//! The engine checks the database's own metadata before every create, so a
//! manifest can be applied any number of times. Two backends sit behind
//! [`admin::DocumentAdmin`]: an embedded sled store for development and tests,
//! and MongoDB.

pub mod admin;
pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod mongo;
pub mod report;
pub mod storage;
pub mod validation;
