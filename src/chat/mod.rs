/// Branch assistance chat: session tracking, request brokering,
/// conversations, and the line protocol that drives them.
pub mod audit;
pub mod broker;
pub mod codec;
pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod idle;
pub mod message;
pub mod missed;
pub mod request;
pub mod server;
pub mod session;
pub mod types;
