#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod task;
