//! Concrete [`ClientWrapper`](crate::client_wrapper::ClientWrapper) implementations.

pub mod http_pool;
pub mod openai_compat;
