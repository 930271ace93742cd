pub mod build_log;
pub mod context;
pub mod health;
pub mod image;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod poller;
pub mod port;

#[cfg(test)]
pub mod testing;
