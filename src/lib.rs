pub mod auth;
pub mod clock;
pub mod compactor;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod rules;
pub mod service;
pub mod sql;
pub mod store;
pub mod tls;
pub mod venue;
pub mod wal;
pub mod wire;
