//! Async WebDAV client with tracked, pausable transfers.
//!
//! ```no_run
//! use dav_client::{ClientConfig, TransferCallbacks, WebDavClient};
//!
//! # async fn run() -> dav_client::Result<()> {
//! let client = WebDavClient::new(
//!     ClientConfig::new("https://cloud.example.com/remote.php/webdav")
//!         .with_basic_auth("alice", "secret"),
//! )?;
//!
//! client.mkdirs("backups/2024").await?;
//! for entry in client.ls("backups/").await? {
//!     println!("{} ({} bytes)", entry.name, entry.size);
//! }
//!
//! let progress =
//!     client.background_download("backups/db.tar", "/tmp/db.tar", TransferCallbacks::new());
//! progress.pause();
//! progress.resume();
//! let bytes = progress.wait().await?;
//! println!("downloaded {} bytes", bytes);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod webdav_xml_parser;


pub use config::{ClientConfig, Credentials};
pub use error::{OperationFailed, Result, WebDavError};
pub use models::FileEntry;
pub use services::webdav::{
    DavMethod, ExpectedStatus, PauseGate, TransferCallbacks, TransferProgress, TransferStatus,
    WebDavClient,
};
