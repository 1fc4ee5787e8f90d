//! Core crate for prompt-to-video generation: jobs, backends, frame
//! normalization, video assembly, storage and model downloads.

pub mod backends;
pub mod config;
pub mod downloads;
pub mod frame;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod params;
pub mod pipeline_cache;
pub mod runtime;
pub mod server;
pub mod services;
pub mod storage;
pub mod video;

#[cfg(test)]
mod test_http;
