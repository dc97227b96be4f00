use prebuilt_fingerprint::{Fingerprint, Platform};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Longest name any supported backend accepts as a single path component or
/// artifact name.
pub const MAX_ARTIFACT_NAME_LEN: usize = 200;

const SEPARATOR: char = '-';
const ESCAPE: char = '_';
const TRUNCATION_TAG_LEN: usize = 8;
/// Precedes the tag of a truncated name. Escaping always follows `_` with two
/// hex digits, so untruncated names never contain it.
const TRUNCATION_MARKER: &str = "_-";

/// Canonical identifier of one cached build.
///
/// Names consist of `[a-z0-9_-]` only. Readable segments (tool prefix,
/// platform, traits) are joined by `-`; any byte outside `[a-z0-9]` inside a
/// segment is escaped as `_xx`, so distinct inputs never collide. The full
/// fingerprint is always the last segment.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactName(String);

impl ArtifactName {
    pub fn new<S: AsRef<str>>(
        tool_prefix: &str,
        platform: Platform,
        traits: &[S],
        hash: &Fingerprint,
    ) -> Self {
        let mut readable = String::new();
        let segments = std::iter::once(tool_prefix)
            .filter(|prefix| !prefix.is_empty())
            .chain(std::iter::once(platform.as_str()))
            .chain(traits.iter().map(AsRef::as_ref));
        for segment in segments {
            if !readable.is_empty() {
                readable.push(SEPARATOR);
            }
            escape_segment(segment, &mut readable);
        }

        let hash = hash.as_str();
        if readable.len() + 1 + hash.len() <= MAX_ARTIFACT_NAME_LEN {
            return Self(format!("{readable}{SEPARATOR}{hash}"));
        }

        // Only the readable part is shortened; a digest of the untruncated
        // part keeps long names distinct.
        let tag = hex::encode(Sha256::digest(readable.as_bytes()));
        let tag = &tag[..TRUNCATION_TAG_LEN];
        let budget = MAX_ARTIFACT_NAME_LEN
            .saturating_sub(hash.len() + TRUNCATION_TAG_LEN + TRUNCATION_MARKER.len() + 1);
        let truncated = readable[..budget.min(readable.len())].trim_end_matches(SEPARATOR);
        Self(format!("{truncated}{TRUNCATION_MARKER}{tag}{SEPARATOR}{hash}"))
    }

    /// Accept a name read back from disk or a remote listing.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_ARTIFACT_NAME_LEN
            && !raw.starts_with(SEPARATOR)
            && raw
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
        valid.then(|| Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The fingerprint segment.
    pub fn hash(&self) -> &str {
        self.0
            .rsplit_once(SEPARATOR)
            .map_or(self.0.as_str(), |(_, hash)| hash)
    }
}

fn escape_segment(segment: &str, out: &mut String) {
    for byte in segment.bytes() {
        if byte.is_ascii_lowercase() || byte.is_ascii_digit() {
            out.push(byte as char);
        } else {
            out.push(ESCAPE);
            out.push_str(&format!("{byte:02x}"));
        }
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for ArtifactName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
