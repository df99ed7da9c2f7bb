pub mod channel;
pub mod events;
pub mod history;
pub mod network;
pub mod registry;
pub mod user_session;
