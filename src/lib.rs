pub mod app;
pub mod broker;
pub mod config;
pub mod core;
pub mod process;
pub mod queue;
