pub mod error;
pub mod intent;
pub mod logging;
pub mod metrics;
pub mod sanitize;
pub mod slice;
pub mod types;

pub use error::*;
pub use intent::*;
pub use metrics::*;
pub use sanitize::*;
pub use slice::*;
pub use types::*;
