pub mod cache;
pub mod client;
pub mod remote;
pub mod selector;

/// Default user agent sent to every API server, derived from the package version
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
