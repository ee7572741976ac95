pub mod cleaner;
pub mod cluster;
pub mod command;
pub mod condor;
pub mod config;
pub mod queue;
pub mod server;
pub mod submit;
