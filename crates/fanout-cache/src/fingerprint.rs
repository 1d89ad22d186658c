use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::sync::Arc;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use sha2::{Digest, Sha256};

/// The set of characters that are escaped in every component of a canonical request.
///
/// Besides controls and everything outside of ASCII, this escapes all the delimiters that are
/// used to join components (`/`, `?`, `&`, `=`, `:`), and `%` itself, so two distinct inputs can
/// never be escaped into the same output.
pub const COMPONENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Percent-encodes a single component of a canonical request (path segment, key or value).
pub fn escape_component(s: &str) -> String {
    utf8_percent_encode(s, COMPONENT).to_string()
}

/// The identity of a logical request.
///
/// Two requests with the same method, resolved URL, headers and body produce equal fingerprints.
/// Equality and hashing only consider the SHA-256 digest, the metadata is kept around for
/// debugging.
#[derive(Debug, Clone, Eq)]
pub struct RequestFingerprint {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl PartialEq for RequestFingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for RequestFingerprint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl RequestFingerprint {
    /// Creates a [`FingerprintBuilder`] for a request using the given HTTP method.
    pub fn builder(method: &str) -> FingerprintBuilder {
        FingerprintBuilder::new(method)
    }

    /// Returns the human-readable metadata that forms the basis of the fingerprint.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the raw SHA-256 digest.
    pub fn digest(&self) -> &[u8; 32] {
        &self.hash
    }

    /// Creates a fingerprint straight from arbitrary metadata.
    pub fn for_testing(metadata: impl Into<String>) -> Self {
        FingerprintBuilder {
            metadata: metadata.into(),
            headers: BTreeMap::new(),
            body: None,
        }
        .build()
    }
}

/// A builder for [`RequestFingerprint`]s.
///
/// The builder accepts human readable, but most importantly **stable**, input. Headers are
/// collected and emitted sorted by their lower-cased name, so the order in which they are added
/// never affects the result. The body is hashed by content.
///
/// Additional metadata can be written through the [`Write`](std::fmt::Write) implementation.
#[derive(Debug)]
pub struct FingerprintBuilder {
    metadata: String,
    headers: BTreeMap<String, Vec<String>>,
    body: Option<Vec<u8>>,
}

impl FingerprintBuilder {
    fn new(method: &str) -> Self {
        Self {
            metadata: format!("method: {}\n", escape_component(method)),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Writes the fully resolved URL of the request.
    ///
    /// The URL is expected to already be canonical, that is percent-encoded with sorted query keys.
    pub fn url(&mut self, url: &str) -> &mut Self {
        // `url` is canonical already, escaping controls guards the line structure.
        let url = utf8_percent_encode(url, CONTROLS);
        self.metadata
            .write_fmt(format_args!("url: {url}\n"))
            .expect("writing to a String never fails");
        self
    }

    /// Adds a header.
    ///
    /// Header names are case-insensitive and are lower-cased. Repeated headers are all kept.
    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.to_owned());
        self
    }

    /// Sets the exact body bytes of the request.
    pub fn body(&mut self, body: &[u8]) -> &mut Self {
        self.body = Some(body.to_vec());
        self
    }

    /// Finalize the [`RequestFingerprint`].
    pub fn build(self) -> RequestFingerprint {
        let Self {
            mut metadata,
            headers,
            body,
        } = self;

        for (name, mut values) in headers {
            values.sort();
            for value in values {
                metadata.push_str("header: ");
                metadata.push_str(&escape_component(&name));
                metadata.push_str(": ");
                metadata.push_str(&escape_component(&value));
                metadata.push('\n');
            }
        }

        if let Some(body) = body {
            let digest = Sha256::digest(&body);
            metadata.push_str(&format!("body: {} bytes, sha256 ", body.len()));
            for b in digest.iter() {
                metadata.push_str(&format!("{b:02x}"));
            }
            metadata.push('\n');
        }

        let hash = Sha256::digest(&metadata);
        // FIXME: `sha2` should really adopt const generics, this is such a pain right now
        let hash = <[u8; 32]>::try_from(hash).expect("sha256 outputs 32 bytes");

        RequestFingerprint {
            metadata: metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for FingerprintBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}
