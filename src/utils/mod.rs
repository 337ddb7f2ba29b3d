pub mod config;
pub mod config_watch;
pub mod disk;
pub mod logging;

pub use config::{CompressConfig, Config};
pub use disk::ByteSize;
