pub mod implementation;
pub mod interface;
