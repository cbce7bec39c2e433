// src/lib.rs
pub mod cli;
pub mod config;
pub mod engine;
pub mod pipelines;
pub mod utils;
pub use cli::Arguments;
