//! Process wiring for the hub agent: configuration, the kubert runtime,
//! the admission webhook and every long-lived task.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admission;
mod args;
mod reviewers;

pub use self::args::Args;
