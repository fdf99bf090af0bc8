pub mod dynamodb_repository;
pub mod persister;
pub mod store;
