pub mod analysis;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod git;
pub mod orchestrator;
pub mod pattern;
pub mod prompts;
pub mod response;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod tools;
