//! Gateway operation codes

/// Gateway operation codes understood by this client.
///
/// Inbound: dispatch, heartbeat, reconnect, invalid session, hello, heartbeat ack.
/// Outbound: heartbeat, identify, resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Server dispatches a named event
    Dispatch = 0,
    /// Heartbeat (client) or immediate heartbeat request (server)
    Heartbeat = 1,
    /// Start a new session
    Identify = 2,
    /// Continue a previous session
    Resume = 6,
    /// Server asks the client to reconnect and resume
    Reconnect = 7,
    /// Session is no longer valid
    InvalidSession = 9,
    /// Sent on connect with the heartbeat interval
    Hello = 10,
    /// Heartbeat acknowledged
    HeartbeatAck = 11,
}

impl OpCode {
    /// Create an `OpCode` from a raw integer value
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    /// Get the raw integer value
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Label used for logs and metrics
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Heartbeat => "heartbeat",
            Self::Identify => "identify",
            Self::Resume => "resume",
            Self::Reconnect => "reconnect",
            Self::InvalidSession => "invalid_session",
            Self::Hello => "hello",
            Self::HeartbeatAck => "heartbeat_ack",
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_from_u8() {
        assert_eq!(OpCode::from_u8(0), Some(OpCode::Dispatch));
        assert_eq!(OpCode::from_u8(6), Some(OpCode::Resume));
        assert_eq!(OpCode::from_u8(10), Some(OpCode::Hello));
        assert_eq!(OpCode::from_u8(11), Some(OpCode::HeartbeatAck));
        // presence update, voice state, request members: not handled here
        assert_eq!(OpCode::from_u8(3), None);
        assert_eq!(OpCode::from_u8(8), None);
    }

    #[test]
    fn test_display_includes_value() {
        assert_eq!(OpCode::InvalidSession.to_string(), "invalid_session (9)");
    }
}
