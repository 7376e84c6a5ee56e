//! Backup orchestration for a fleet of PostgreSQL, MongoDB, QuestDB and
//! Qdrant hosts.
//!
//! The API server ([`orchestrator`], [`routes`]) publishes backup triggers to
//! a queue, either right away or through a delayed task scheduler. One worker
//! process per database kind ([`worker`]) consumes those triggers, produces a
//! compressed artifact on the remote host over SSH and streams it into blob
//! storage. External services sit behind the traits in [`adapters`].

pub mod adapters;
pub mod clock;
pub mod config;
pub mod errors;
pub mod gcp;
pub mod orchestrator;
pub mod routes;
pub mod server;
pub mod types;
pub mod worker;
