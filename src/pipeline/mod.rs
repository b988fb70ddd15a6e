pub mod cascade_pipeline;
pub mod config;
pub mod module;
