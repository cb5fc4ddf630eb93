pub mod config;
pub mod http;
pub mod image_processing;
pub mod records;
pub mod storage;
pub mod transform;
