#![allow(dead_code)]

pub mod client;
pub mod harness;
pub mod net;
pub mod origin;

pub use client::*;
pub use harness::*;
pub use net::*;
pub use origin::*;
