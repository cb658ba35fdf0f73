//! SIEM analytics back-end.
//!
//! Consumes endpoint-security events from the bus and produces two parallel
//! analytic streams: complex-event pattern alerts via a streaming-SQL engine
//! (the CEP path) and online per-user risk scores (the UEBA path). A search
//! engine stores the rule catalogue, baselines, events, alerts and scores.
//!
//! Modules:
//! - [`rules`] — rule model and the three compilations of one condition
//!   vocabulary: streaming SQL, in-memory evaluation, search bool queries
//! - [`cep`] — SQL-gateway session, job reconciler, alert sink, control plane
//! - [`ueba`] — scorer, baselines, recovery, consumer, control plane
//! - [`logsink`] — raw-topic normaliser feeding the shared event topic

pub mod cef;
pub mod cep;
pub mod clock;
pub mod config;
pub mod error;
pub mod fieldmeta;
pub mod indices;
pub mod kafka;
pub mod logsink;
pub mod rules;
pub mod search;
pub mod ueba;
