pub mod config;
pub mod emotion;
pub mod error;
pub mod gradcam;
pub mod handler;
pub mod preprocess;
pub mod server;
pub mod visualize;

pub use error::{Error, Result};

use tracing_subscriber::EnvFilter;

/// `RUST_LOG` style filtering, `info` when unset.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
