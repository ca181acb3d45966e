pub mod commands;
pub mod connection;
pub mod coordinator;
pub mod device;
pub mod extract;
pub mod fields;
pub mod output;
pub mod readings;
