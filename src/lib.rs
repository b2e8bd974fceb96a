pub mod capture;
pub mod config;
pub mod logging;
pub mod record;
pub mod record_log;
pub mod replay;
pub mod sessions;
pub mod sync;
pub mod wire;
