//! Wire-level protocol types: inbound commands and outbound responses.
//!
//! Shared between the two: insertion-ordered string maps for macros and
//! ESMTP arguments, and the lossy text decoders mirroring what MTAs
//! actually put on the wire.

pub mod commands;
pub mod responses;

use crate::error::MilterError;

// ── Macros ───────────────────────────────────────────────────────

/// MTA-supplied symbols for one stage, in the order they were sent.
///
/// Duplicate names keep their first position but take the last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Macros(Vec<(String, String)>);

impl Macros {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy every entry into `other`, overriding existing values.
    pub fn merge_into(&self, other: &mut Macros) {
        for (n, v) in self.iter() {
            other.insert(n, v);
        }
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Macros {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut macros = Macros::new();
        for (n, v) in iter {
            macros.insert(n, v);
        }
        macros
    }
}

// ── EsmtpArgs ────────────────────────────────────────────────────

/// ESMTP `KEY[=VALUE]` arguments attached to MAIL FROM / RCPT TO, in the
/// order they were sent. A keyword without a value stores `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EsmtpArgs(Vec<(String, Option<String>)>);

impl EsmtpArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, keyword: impl Into<String>, value: Option<String>) {
        let keyword = keyword.into();
        match self.0.iter_mut().find(|(k, _)| *k == keyword) {
            Some(slot) => slot.1 = value,
            None => self.0.push((keyword, value)),
        }
    }

    /// Look up a keyword. The outer `Option` is presence, the inner the
    /// keyword's value.
    pub fn get(&self, keyword: &str) -> Option<Option<&str>> {
        self.0
            .iter()
            .find(|(k, _)| k == keyword)
            .map(|(_, v)| v.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render as the space-joined `K` / `K=V` wire form.
    pub fn to_wire_string(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!("{k}={v}"),
                None => k.clone(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl<K: Into<String>> FromIterator<(K, Option<String>)> for EsmtpArgs {
    fn from_iter<T: IntoIterator<Item = (K, Option<String>)>>(iter: T) -> Self {
        let mut args = EsmtpArgs::new();
        for (k, v) in iter {
            args.insert(k, v);
        }
        args
    }
}

// ── Text decoding ────────────────────────────────────────────────

/// Decode UTF-8 with invalid bytes rendered as `\xNN` escapes.
pub(crate) fn decode_utf8_escaped(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    let mut rest = data;
    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                out.push_str(s);
                return out;
            }
            Err(e) => {
                if let Ok(valid) = std::str::from_utf8(&rest[..e.valid_up_to()]) {
                    out.push_str(valid);
                }
                let bad_len = match e.error_len() {
                    Some(n) => n,
                    None => rest.len() - e.valid_up_to(),
                };
                for b in &rest[e.valid_up_to()..e.valid_up_to() + bad_len] {
                    push_escaped(&mut out, *b);
                }
                if e.error_len().is_none() {
                    return out;
                }
                rest = &rest[e.valid_up_to() + bad_len..];
            }
        }
    }
}

/// Decode ASCII with non-ASCII bytes rendered as `\xNN` escapes.
pub(crate) fn decode_ascii_escaped(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        if b.is_ascii() {
            out.push(b as char);
        } else {
            push_escaped(&mut out, b);
        }
    }
    out
}

/// Strict UTF-8 decode, a violation on invalid input.
pub(crate) fn decode_utf8_strict(data: &[u8], what: &str) -> Result<String, MilterError> {
    std::str::from_utf8(data)
        .map(str::to_owned)
        .map_err(|_| {
            MilterError::ProtocolViolationCommandData(format!(
                "could not decode {what}: {data:?}"
            ))
        })
}

/// Strict ASCII decode, a violation on invalid input.
pub(crate) fn decode_ascii_strict(data: &[u8], what: &str) -> Result<String, MilterError> {
    if !data.is_ascii() {
        return Err(MilterError::ProtocolViolationCommandData(format!(
            "could not decode {what} as ASCII: {data:?}"
        )));
    }
    decode_utf8_strict(data, what)
}

fn push_escaped(out: &mut String, b: u8) {
    out.push_str(&format!("\\x{b:02x}"));
}

/// Strip one trailing NUL (if any) and split the rest on NULs.
///
/// Empty input yields no items; a lone NUL yields one empty item, matching
/// the wire convention that an empty-but-present string is a bare NUL.
pub(crate) fn split_nul_array(data: &[u8]) -> Vec<&[u8]> {
    if data.is_empty() {
        return Vec::new();
    }
    let trimmed = data.strip_suffix(b"\x00").unwrap_or(data);
    trimmed.split(|&b| b == 0).collect()
}
