pub mod azure;
pub mod common;
pub mod dbal;
pub mod local;
pub mod memory;
