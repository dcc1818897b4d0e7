pub mod config;
pub mod ddns;
pub mod dns_hints;
pub mod http;
pub mod kite;
pub mod net;
pub mod supervisor;

pub use kite::Kite;
