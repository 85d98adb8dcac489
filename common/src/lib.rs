pub mod types;
pub mod error;
pub mod config;
pub mod logging;

pub use types::*;
pub use error::*;
pub use self::config::*;

#[doc(hidden)]
pub use tracing;
