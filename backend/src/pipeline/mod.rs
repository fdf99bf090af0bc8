pub mod admission;
pub mod coordinator;
