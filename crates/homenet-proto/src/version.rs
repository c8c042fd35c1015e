//! Protocol version negotiation.
//!
//! The client lists the versions it speaks in StartConversation; the server
//! picks the highest one it supports and pins it for the lifetime of the
//! conversation.

use crate::messages::SemVer;

/// Versions this server speaks, ascending.
pub const SUPPORTED_VERSIONS: &[SemVer] = &[SemVer {
    major: 1,
    minor: 0,
    patch: 0,
}];

/// Pick the highest mutually supported version, or `None` if the client
/// offers nothing we speak.
pub fn negotiate(client_versions: &[SemVer]) -> Option<SemVer> {
    client_versions
        .iter()
        .filter(|v| SUPPORTED_VERSIONS.contains(v))
        .max()
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(major: u32, minor: u32, patch: u32) -> SemVer {
        SemVer {
            major,
            minor,
            patch,
        }
    }

    #[test]
    fn test_negotiate_exact_match() {
        assert_eq!(negotiate(&[v(1, 0, 0)]), Some(v(1, 0, 0)));
    }

    #[test]
    fn test_negotiate_picks_supported_among_unknown() {
        assert_eq!(
            negotiate(&[v(2, 0, 0), v(1, 0, 0), v(0, 9, 0)]),
            Some(v(1, 0, 0))
        );
    }

    #[test]
    fn test_negotiate_no_overlap() {
        assert_eq!(negotiate(&[v(2, 0, 0), v(3, 1, 4)]), None);
        assert_eq!(negotiate(&[]), None);
    }
}
