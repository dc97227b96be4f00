use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the local store, remote providers, and the resolver.
///
/// Only [`CacheError::Fingerprint`] and [`CacheError::Build`] ever escape the
/// resolver; every other variant is logged there and degrades to a miss.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {message}")]
    Json { message: String },

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Fingerprint(#[from] prebuilt_fingerprint::FingerprintError),

    #[error("invalid archive path: {path:?}")]
    InvalidArchivePath { path: PathBuf },

    #[error("unsupported archive entry type for {path:?}")]
    UnsupportedArchiveEntryType { path: PathBuf },

    #[error("archive is empty")]
    EmptyArchive,

    #[error("artifact checksum mismatch for {locator}: expected {expected}, found {found}")]
    ChecksumMismatch {
        locator: String,
        expected: String,
        found: String,
    },

    #[error("http request failed: {message}")]
    Http { status: Option<u16>, message: String },

    #[error("malformed remote response: {message}")]
    MalformedResponse { message: String },

    #[error("unsupported remote location {url}")]
    UnsupportedLocation { url: String },

    #[error("remote cache provider is disabled")]
    ProviderDisabled,

    #[error("artifact source {path} does not exist or is empty")]
    MissingArtifact { path: PathBuf },

    #[error("operation cancelled")]
    Cancelled,

    #[error("build command failed: {source}")]
    Build {
        #[source]
        source: std::io::Error,
    },

    #[cfg(feature = "s3")]
    #[error("s3 request failed: {message}")]
    S3 {
        message: String,
        /// HTTP status of the service response, if one was received.
        status: Option<u16>,
    },
}

impl CacheError {
    /// Whether retrying the same request may succeed.
    ///
    /// Transport failures, server errors, `408` and `429` are transient; other
    /// client errors and local failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::Http { status, .. } => status.map_or(true, is_transient_status),
            #[cfg(feature = "s3")]
            CacheError::S3 { status, .. } => status.map_or(true, is_transient_status),
            _ => false,
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        // Remote responses can echo user paths or tokens inside string values.
        let message = sanitize_json_error_message(&err.to_string());
        Self::Json { message }
    }
}

fn sanitize_json_error_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];

        let mut end = None;
        let bytes = rest.as_bytes();
        for (idx, &b) in bytes.iter().enumerate() {
            if b != b'"' {
                continue;
            }
            // A quote preceded by an odd number of backslashes is escaped.
            let mut backslashes = 0usize;
            let mut k = idx;
            while k > 0 && bytes[k - 1] == b'\\' {
                backslashes += 1;
                k -= 1;
            }
            if backslashes % 2 == 0 {
                end = Some(idx);
                break;
            }
        }

        let Some(end) = end else {
            out.push_str("<redacted>");
            rest = "";
            break;
        };
        out.push_str("<redacted>\"");
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}
