pub mod classifier;
pub mod config;
pub mod error;
pub mod extraction;
pub mod llm;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod store;
