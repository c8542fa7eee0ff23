pub mod app;
pub mod callback;
pub mod config;
pub mod error;
pub mod event;
pub mod keyevent;
pub mod net_tool;
pub mod phone;
pub mod port_allocator;
pub mod template;
pub mod version;

pub use error::{Error, Result};
