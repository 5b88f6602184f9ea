pub mod auth;
pub mod config;
pub mod limits;
pub mod model;
pub mod observability;
pub mod session;
pub mod sql;
pub mod store;
pub mod sync;
pub mod tls;
pub mod wire;
pub mod yard;
