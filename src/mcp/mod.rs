pub mod client;
pub mod discovery;
pub mod error;
pub mod transport;

pub use client::ToolProvider;
pub use transport::resolve;
