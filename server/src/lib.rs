pub mod auth;
pub mod connection;
mod connection_tx_storage;
pub mod server;
mod server_state;
pub mod store;
