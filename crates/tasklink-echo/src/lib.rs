//! tasklink-echo: loopback transport and demo driver for tasklink.

pub mod demo;
pub mod loopback;

pub use demo::{DemoOptions, DemoReport, EchoError, run};
pub use loopback::LoopbackTransport;
