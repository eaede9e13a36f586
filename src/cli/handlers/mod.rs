// src/cli/handlers/mod.rs

// One module per command.

pub mod cancel;
pub mod commons;
pub mod run;
pub mod status;
