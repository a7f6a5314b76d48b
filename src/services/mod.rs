pub mod archive;
pub mod error;
pub mod temp_upload;
pub mod upload_collector;
pub mod watermark;
pub mod worker;
