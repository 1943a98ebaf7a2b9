// src/lib.rs
pub mod codec;
pub mod types;
pub mod crypto;
pub mod registry;
pub mod message;
pub mod consensus;
pub mod net;
pub mod sim;
