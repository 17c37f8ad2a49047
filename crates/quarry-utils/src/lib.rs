pub mod atomic_write;
pub mod canonical;
pub mod error;
pub mod ids;
pub mod logging;
