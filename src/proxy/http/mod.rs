pub mod body;
pub mod cache_control;
pub mod conditional;
pub mod server;
