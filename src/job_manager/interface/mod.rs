pub mod network;
pub mod types;
