// WebDAV client modules

pub mod common;
pub mod paths; // Working directory and URL resolution
pub mod progress; // Transfer progress tracking and the pause gate
pub mod service;
pub mod status; // Status-code contract per operation
pub mod transfer; // Chunked streaming engine

// Re-export main types for convenience
pub use paths::PathResolver;
pub use progress::{PauseGate, TransferProgress, TransferStatus, RATE_WINDOW};
pub use service::{WebDavClient, MAX_LS_REDIRECTS};
pub use status::{check_status, DavMethod, ExpectedStatus};
pub use transfer::{
    copy_chunked, CompletionCallback, ProgressCallback, TransferCallbacks, TransferOptions,
    CHUNK_SIZE,
};
