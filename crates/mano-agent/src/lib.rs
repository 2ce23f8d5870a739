pub mod bandwidth;
pub mod config;
pub mod http;
pub mod reconcile;

pub use bandwidth::*;
pub use config::*;
pub use http::*;
pub use reconcile::*;
