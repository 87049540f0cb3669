pub mod agent;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod events;
pub mod guard;
pub mod memory;
pub mod runner;
pub mod runtime;
pub mod secrets;
pub mod shutdown;
pub mod source;
pub mod tools;
pub mod types;
pub mod watcher;
pub mod workspace;
