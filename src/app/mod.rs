//! Application module: command line surface of the `relaybus` binary

pub mod cli;
pub mod commands;
pub mod startup;
