//! Offline resilience for web clients: a TTL cache behind a worker, request
//! interception with offline fallbacks, a durable mutation queue and a
//! connectivity-driven sync controller.

pub mod app;
pub mod cache;
pub mod config;
pub mod db;
pub mod event;
pub mod http;
pub mod ids;
pub mod intercept;
pub mod logging;
pub mod network;
pub mod queue;
pub mod sync;
pub mod worker;

pub use app::App;
pub use config::Config;
