pub mod command;
pub mod probe;
pub mod stats;
pub mod tc;
pub mod validate;
pub mod vxlan;

pub use command::*;
pub use probe::*;
pub use stats::*;
pub use tc::*;
pub use validate::*;
pub use vxlan::*;
