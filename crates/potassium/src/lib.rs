#![doc = include_str!("../README.md")]

mod app;
mod config;
mod dispatcher;
mod error;
pub mod mailbox;
pub mod pool;
pub mod server;
mod status;
mod tracker;
mod types;

pub use crate::app::*;
pub use crate::config::*;
pub use crate::dispatcher::*;
pub use crate::error::*;
pub use crate::status::*;
pub use crate::tracker::*;
pub use crate::types::*;
