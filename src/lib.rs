// src/lib.rs
pub mod clock;
pub mod config;
pub mod drivers;
pub mod engine;
pub mod recorder;
pub mod types;
