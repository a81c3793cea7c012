pub mod http;
pub mod metrics;

pub use http::run_admin_server;
