pub mod codec;
pub mod command;
pub mod envelope;
pub mod handshake;
