#![forbid(unsafe_code)]

pub mod git;
pub mod naming;
pub mod process;
