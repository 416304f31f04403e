//! Connection-level plumbing: identifiers and the per-connection handler.

pub mod connection;

pub use connection::{ConnectionHandle, handle_connection};

/// Opaque unique identifier for one MTA↔milter connection.
///
/// 128 random bits; the short form (first 8 hex characters) tags every log
/// line of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u128);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        format!("{:08x}", (self.0 >> 96) as u32)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_is_a_prefix_of_the_full_form() {
        let id = ConnectionId::generate();
        assert_eq!(id.short().len(), 8);
        assert!(id.to_string().starts_with(&id.short()));
        assert_eq!(id.to_string().len(), 32);
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(ConnectionId::generate(), ConnectionId::generate());
    }
}
