pub mod http;
pub mod orchestrator;
pub mod transport_client;

pub use http::*;
pub use orchestrator::*;
pub use transport_client::*;
