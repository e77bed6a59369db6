use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::ids::{Id, UNKNOWN_ID};

/// Communication endpoint as a `(source, target, cookie)` triple.
///
/// An address is valid iff its source is known. Text form is
/// `"<source>.<target>.<cookie>"` in decimal; the binary form writes the
/// three fields in that order as little-endian `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub source: Id,
    pub target: Id,
    pub cookie: Id,
}

impl Address {
    /// Address with every field set to the unknown sentinel.
    pub const UNKNOWN: Address = Address {
        source: UNKNOWN_ID,
        target: UNKNOWN_ID,
        cookie: UNKNOWN_ID,
    };

    /// Size of the binary form in bytes
    pub const ENCODED_LEN: usize = 24;

    pub const fn new(source: Id, target: Id, cookie: Id) -> Self {
        Self {
            source,
            target,
            cookie,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.source != UNKNOWN_ID
    }

    /// Returns true if a target has been bound.
    pub fn has_target(&self) -> bool {
        self.target != UNKNOWN_ID
    }

    pub fn with_target(self, target: Id) -> Self {
        Self { target, ..self }
    }

    pub fn with_cookie(self, cookie: Id) -> Self {
        Self { cookie, ..self }
    }

    pub fn cleared_target(self) -> Self {
        self.with_target(UNKNOWN_ID)
    }

    /// Reset every field to unknown.
    pub fn invalidate(&mut self) {
        *self = Self::UNKNOWN;
    }

    /// Parse the dotted text form.
    ///
    /// Anything other than exactly three decimal fields separated by two dots
    /// yields [`Address::UNKNOWN`]; no error is reported, callers check
    /// [`Address::is_valid`].
    pub fn from_str_lenient(text: &str) -> Self {
        let mut fields = [UNKNOWN_ID; 3];
        let mut parts = text.split('.');

        for slot in fields.iter_mut() {
            match parts.next().and_then(parse_decimal) {
                Some(value) => *slot = value,
                None => return Self::UNKNOWN,
            }
        }

        if parts.next().is_some() {
            return Self::UNKNOWN;
        }

        Self::new(fields[0], fields[1], fields[2])
    }

    /// Write the binary form
    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.source);
        buf.put_u64_le(self.target);
        buf.put_u64_le(self.cookie);
    }

    /// Read the binary form.
    ///
    /// A truncated buffer is left untouched and yields [`Address::UNKNOWN`].
    pub fn read_from<B: Buf>(buf: &mut B) -> Self {
        if buf.remaining() < Self::ENCODED_LEN {
            return Self::UNKNOWN;
        }

        let source = buf.get_u64_le();
        let target = buf.get_u64_le();
        let cookie = buf.get_u64_le();
        Self::new(source, target, cookie)
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.source, self.target, self.cookie)
    }
}

impl FromStr for Address {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_str_lenient(s))
    }
}

fn parse_decimal(field: &str) -> Option<Id> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}
