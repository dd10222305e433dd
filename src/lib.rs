pub mod agents;
pub mod app;
pub mod cli;
pub mod config;
pub mod deploy;
pub mod doctor;
pub mod error;
pub mod parser;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod router;
pub mod server;
pub mod setup;
pub mod telemetry;
pub mod validators;
pub mod vram;

#[cfg(test)]
mod tests;
