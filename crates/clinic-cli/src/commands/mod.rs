pub mod common;
pub mod patient;
pub mod queue;
pub mod sync;
