pub mod auth;
pub mod calendar;
pub mod cancellation;
pub mod config;
pub mod engine;
pub mod limits;
pub mod matching;
pub mod model;
pub mod notify;
pub mod observability;
pub mod ratelimit;
pub mod reaper;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
