//! Operations on PostgreSQL instances

pub mod apply;
pub mod configure;
pub mod discovery;
pub mod env;
pub mod init;
pub mod lifecycle;
pub mod logs;
pub mod ssl;
pub mod upgrade;

pub use apply::apply;
pub use discovery::{ActualState, discover};
