pub mod client;
pub mod handler;
pub mod proto;
pub mod sasl;
