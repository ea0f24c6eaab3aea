//! Connection role (client or server).

/// WebSocket connection role.
///
/// Determines masking of outgoing frames per RFC 6455: clients set the
/// mask bit on every frame they send, servers never do. This core always
/// uses the zero mask key on the client side, so the transform itself is
/// the identity while the wire format stays conformant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Client role: outgoing frames carry the mask bit and key.
    Client,
    /// Server role: outgoing frames are unmasked.
    Server,
}

impl Role {
    /// Whether outgoing frames carry the mask bit.
    #[inline]
    #[must_use]
    pub const fn must_mask(&self) -> bool {
        matches!(self, Role::Client)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "Client"),
            Role::Server => write!(f, "Server"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_must_mask() {
        assert!(Role::Client.must_mask());
        assert!(!Role::Server.must_mask());
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Client.to_string(), "Client");
        assert_eq!(Role::Server.to_string(), "Server");
    }
}
