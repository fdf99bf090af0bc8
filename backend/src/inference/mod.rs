pub mod client;
pub mod invoker;
