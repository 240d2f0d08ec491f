pub mod codec;
pub mod collab;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod session;
pub mod transfer;
