//! Constants shared by the slot clients, the capture step and the sinks.

/// User agent sent with archival and capture requests.
pub const ARCHIVAL_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Timeout of a single outbound HTTP request.
pub const HTTP_TIMEOUT_SECS: u64 = 120;

/// Largest HTML body the capture step keeps, in bytes.
pub const MAX_HTML_BYTES: usize = 16 * 1024 * 1024;
