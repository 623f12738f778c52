//! Common utilities shared by the WebDAV client

/// Build the User-Agent string sent with every request
pub fn build_user_agent() -> String {
    format!("{}/{} (WebDAV client)", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
