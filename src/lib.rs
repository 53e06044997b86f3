pub mod compensation;
pub mod config;
pub mod events;
pub mod heartbeat;
pub mod logging;
pub mod orchestrator;
pub mod pools;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod tests;
