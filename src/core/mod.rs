pub mod error;
pub mod helpers;
pub mod trace;
pub mod types;
