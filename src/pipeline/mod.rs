#![forbid(unsafe_code)]

pub mod ports;
pub mod processor;
pub mod worker;
