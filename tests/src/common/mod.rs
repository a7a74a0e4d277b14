pub mod docker;
pub mod ibc;
