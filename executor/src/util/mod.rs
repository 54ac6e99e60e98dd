pub mod async_teardown;
pub mod names;
pub mod path_security;

pub use async_teardown::*;
