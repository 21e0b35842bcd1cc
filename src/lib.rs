pub mod builtins;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod parser;
pub mod shell;
pub mod signals;
