pub mod s3_service;
pub mod uploader;
