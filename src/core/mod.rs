// src/core/mod.rs

pub mod command_builder;
pub mod config_loader;
pub mod expander;
pub mod param_file;
pub mod paths;
pub mod progress;
pub mod storage;
pub mod templates;
