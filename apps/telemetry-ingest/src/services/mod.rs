pub mod retention;
pub mod retry;
pub mod stats;
pub mod workers;
