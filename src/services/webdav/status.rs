use std::fmt;

use reqwest::Method;

use crate::error::OperationFailed;

/// The subset of HTTP/WebDAV methods this client issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DavMethod {
    Head,
    Get,
    Put,
    Delete,
    Mkcol,
    Propfind,
}

impl DavMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DavMethod::Head => "HEAD",
            DavMethod::Get => "GET",
            DavMethod::Put => "PUT",
            DavMethod::Delete => "DELETE",
            DavMethod::Mkcol => "MKCOL",
            DavMethod::Propfind => "PROPFIND",
        }
    }

    /// Human readable name of the operation, used in failure messages
    pub fn operation_name(&self) -> &'static str {
        match self {
            DavMethod::Head => "get header",
            DavMethod::Get => "download",
            DavMethod::Put => "upload",
            DavMethod::Delete => "delete",
            DavMethod::Mkcol => "create directory",
            DavMethod::Propfind => "list directory",
        }
    }

    pub fn to_reqwest(&self) -> Method {
        match self {
            DavMethod::Head => Method::HEAD,
            DavMethod::Get => Method::GET,
            DavMethod::Put => Method::PUT,
            DavMethod::Delete => Method::DELETE,
            // Extension methods are valid tokens, from_bytes cannot fail on them
            DavMethod::Mkcol | DavMethod::Propfind => {
                Method::from_bytes(self.as_str().as_bytes()).unwrap_or(Method::GET)
            }
        }
    }
}

impl fmt::Display for DavMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status codes an operation accepts.
///
/// `One` is an exact match, `AnyOf` is set membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedStatus {
    One(u16),
    AnyOf(Vec<u16>),
}

impl ExpectedStatus {
    pub fn contains(&self, code: u16) -> bool {
        match self {
            ExpectedStatus::One(expected) => *expected == code,
            ExpectedStatus::AnyOf(expected) => expected.contains(&code),
        }
    }

    pub fn codes(&self) -> &[u16] {
        match self {
            ExpectedStatus::One(code) => std::slice::from_ref(code),
            ExpectedStatus::AnyOf(codes) => codes,
        }
    }
}

impl From<u16> for ExpectedStatus {
    fn from(code: u16) -> Self {
        ExpectedStatus::One(code)
    }
}

impl From<&[u16]> for ExpectedStatus {
    fn from(codes: &[u16]) -> Self {
        ExpectedStatus::AnyOf(codes.to_vec())
    }
}

impl<const N: usize> From<[u16; N]> for ExpectedStatus {
    fn from(codes: [u16; N]) -> Self {
        ExpectedStatus::AnyOf(codes.to_vec())
    }
}

/// Fails with [`OperationFailed`] unless `actual` is one of the `expected` codes.
pub fn check_status(
    method: DavMethod,
    path: &str,
    expected: impl Into<ExpectedStatus>,
    actual: u16,
) -> Result<(), OperationFailed> {
    let expected = expected.into();
    if expected.contains(actual) {
        Ok(())
    } else {
        Err(OperationFailed::new(method, path, expected, actual))
    }
}
