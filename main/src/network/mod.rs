pub mod interface;
pub mod probe;
