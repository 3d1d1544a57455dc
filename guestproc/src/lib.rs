pub mod broker;
pub mod cli;
pub mod commands;
pub mod config;
pub mod context;
pub mod create;
pub mod descriptor;
pub mod error;
pub mod lifecycle;
pub mod loader;
pub mod memory;
pub mod output;
pub mod process;
pub mod programs;
pub mod protocol;
pub mod signals;
pub mod spawn;
pub mod startup;
