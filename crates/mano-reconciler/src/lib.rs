pub mod cache;
pub mod config;
pub mod controller;
pub mod metrics;
pub mod optimized;
pub mod predicate;
pub mod reconciler;
pub mod store;
pub mod testing;

pub use cache::*;
pub use config::*;
pub use controller::*;
pub use metrics::*;
pub use optimized::*;
pub use reconciler::*;
pub use store::*;
