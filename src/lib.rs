//! Client for the XDG Desktop Portal ScreenCast interface.
//!
//! This crate negotiates a screencast session with
//! `org.freedesktop.portal.Desktop` and hands the resulting PipeWire stream
//! to a media pipeline.

pub mod config;
pub mod desktop_client;
pub mod error;
pub mod pipeline;
pub mod portal;

pub use error::{PortalError, Result};
