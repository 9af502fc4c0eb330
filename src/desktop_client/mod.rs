//! Interface layer towards the desktop portal service.
//!
//! This module owns the D-Bus bindings we use to talk to
//! `org.freedesktop.portal.Desktop`. Only the ScreenCast API is implemented.

use zbus::{Connection, Result};

/// Client wrapper for the desktop portal's D-Bus APIs.
#[derive(Clone)]
pub struct DesktopClient {
    pub(crate) connection: Connection,
}

impl DesktopClient {
    /// Creates a new client using the given D-Bus connection.
    pub async fn new(connection: Connection) -> Result<Self> {
        Ok(Self { connection })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

pub mod screencast;
