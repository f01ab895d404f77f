//! Header field representation.
//!
//! A field is a name-value pair, optionally recognized as a well-known header
//! so that indexing and Huffman policies can be applied per header.

use std::fmt;

use bytes::Bytes;

/// Well-known header names the encoder applies policies to.
///
/// Only headers that appear in an encoding policy set need to be recognized;
/// everything else is carried as a plain name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Authorization,
    ContentMd5,
    ContentRange,
    ETag,
    IfMatch,
    IfModifiedSince,
    IfNoneMatch,
    IfRange,
    IfUnmodifiedSince,
    LastModified,
    Location,
    ProxyAuthenticate,
    ProxyAuthorization,
    Range,
    RetryAfter,
    SetCookie,
    SetCookie2,
}

impl Header {
    /// Case-insensitive lookup from a header name.
    pub fn from_name(name: &str) -> Option<Header> {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "authorization" => Some(Header::Authorization),
            "content-md5" => Some(Header::ContentMd5),
            "content-range" => Some(Header::ContentRange),
            "etag" => Some(Header::ETag),
            "if-match" => Some(Header::IfMatch),
            "if-modified-since" => Some(Header::IfModifiedSince),
            "if-none-match" => Some(Header::IfNoneMatch),
            "if-range" => Some(Header::IfRange),
            "if-unmodified-since" => Some(Header::IfUnmodifiedSince),
            "last-modified" => Some(Header::LastModified),
            "location" => Some(Header::Location),
            "proxy-authenticate" => Some(Header::ProxyAuthenticate),
            "proxy-authorization" => Some(Header::ProxyAuthorization),
            "range" => Some(Header::Range),
            "retry-after" => Some(Header::RetryAfter),
            "set-cookie" => Some(Header::SetCookie),
            "set-cookie2" => Some(Header::SetCookie2),
            _ => None,
        }
    }
}

/// An HTTP field line (name-value pair).
///
/// Names are normalized to lowercase on construction (the HTTP/3 wire
/// requirement); a `None` value passed to
/// [`HeaderField::with_optional_value`] is normalized to the empty string
/// before the field touches any table.
#[derive(Clone, PartialEq, Eq)]
pub struct HeaderField {
    name: String,
    value: String,
    header: Option<Header>,
    /// Cached wire form, emitted verbatim instead of re-encoding.
    pre_encoded: Option<Bytes>,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut name = name.into();
        name.make_ascii_lowercase();
        let header = Header::from_name(&name);
        Self {
            name,
            value: value.into(),
            header,
            pre_encoded: None,
        }
    }

    pub fn with_optional_value(name: impl Into<String>, value: Option<String>) -> Self {
        Self::new(name, value.unwrap_or_default())
    }

    /// A field carrying a cached field-line encoding, written to the section
    /// as-is. The cached bytes must not reference the dynamic table.
    pub fn pre_encoded(name: impl Into<String>, value: impl Into<String>, encoded: Bytes) -> Self {
        let mut field = Self::new(name, value);
        field.pre_encoded = Some(encoded);
        field
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn header(&self) -> Option<Header> {
        self.header
    }

    pub(crate) fn encoded(&self) -> Option<&Bytes> {
        self.pre_encoded.as_ref()
    }

    /// Table accounting size per RFC 9204 Section 3.2.1.
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }

    /// Exact match, with the case-insensitive name comparison HTTP requires.
    pub fn matches(&self, name: &str, value: &str) -> bool {
        self.name.eq_ignore_ascii_case(name) && self.value == value
    }
}

impl fmt::Debug for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeaderField({}: {})", self.name, self.value)
    }
}
