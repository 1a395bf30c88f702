#![doc = include_str!("../README.md")]

pub mod error;
pub mod frameline;
pub mod interval;
pub mod maps;
pub mod render;
pub mod sample;
pub mod server;
pub mod session;
pub mod spool;
pub mod stopper;
pub mod symbolize;
pub mod threads;
pub mod walker;

pub use error::{Error, Result};
pub use maps::{Arch, DynamicLibMapping, MappingSnapshot};
pub use render::OutputFormat;
pub use sample::{SENTINEL_SP, Sample, StackFrame};
pub use session::{SessionConfig, SessionReport, run_session};
pub use symbolize::{SingleFrame, SymbolisedStackFrame, Symbolizer};
