use std::fmt;

use subtle::ConstantTimeEq;

/// A scoped byte buffer that zeroes its backing memory on drop.
///
/// The polyglot adapters stage rendered foreign programs in these: the
/// rendered text embeds injected host values, which may be sensitive, and
/// must not linger in freed allocations. Clones propagate the same
/// discipline; equality is constant-time.
pub struct SecureBuf {
    data: Vec<u8>,
}

impl SecureBuf {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    pub fn from_string(s: String) -> Self {
        Self {
            data: s.into_bytes(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_str(&self) -> &str {
        // Construction from `String` keeps this UTF-8; byte constructors
        // are only used with ASCII material.
        std::str::from_utf8(&self.data).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Clone for SecureBuf {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

impl Drop for SecureBuf {
    fn drop(&mut self) {
        for byte in &mut self.data {
            *byte = 0;
        }
    }
}

impl PartialEq for SecureBuf {
    fn eq(&self, other: &Self) -> bool {
        self.data.len() == other.data.len() && bool::from(self.data.ct_eq(&other.data))
    }
}

impl Eq for SecureBuf {}

impl fmt::Debug for SecureBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBuf({} bytes)", self.data.len())
    }
}

/// Constant-time equality for content hashes, used when verifying cache
/// keys against stored metadata.
pub fn ct_str_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}
