//! Background services and their lifecycle manager.

pub mod http_server;
pub mod logging;
pub mod manager;

pub use http_server::HttpServerService;
pub use manager::{Service, ServiceHealth, ServicesManager, ServicesManagerBuilder};
