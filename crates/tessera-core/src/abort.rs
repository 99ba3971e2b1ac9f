//! Abort reason codes shared by buffers and the `SendAborted` message.

use core::fmt;

/// Reason code carried by an aborted buffer and by `SendAborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum AbortCode {
    Unknown = 0,
    Cancelled = 1,
    Timeout = 2,
    /// The sender stopped responding to loss notifications.
    SenderDied = 3,
    /// The receiver never acknowledged a fully sent block.
    ReceiverUnresponsive = 4,
    Disconnected = 5,
    Restarted = 6,
    Overloaded = 7,
    /// The upstream source of a forwarded block failed.
    UpstreamFailed = 8,
    Internal = 9,
}

impl AbortCode {
    /// Decode a wire code. Codes from a newer peer map to `Unknown`.
    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => AbortCode::Cancelled,
            2 => AbortCode::Timeout,
            3 => AbortCode::SenderDied,
            4 => AbortCode::ReceiverUnresponsive,
            5 => AbortCode::Disconnected,
            6 => AbortCode::Restarted,
            7 => AbortCode::Overloaded,
            8 => AbortCode::UpstreamFailed,
            9 => AbortCode::Internal,
            _ => AbortCode::Unknown,
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AbortCode::Unknown => "unknown",
            AbortCode::Cancelled => "cancelled",
            AbortCode::Timeout => "timeout",
            AbortCode::SenderDied => "sender died",
            AbortCode::ReceiverUnresponsive => "receiver unresponsive",
            AbortCode::Disconnected => "disconnected",
            AbortCode::Restarted => "restarted",
            AbortCode::Overloaded => "overloaded",
            AbortCode::UpstreamFailed => "upstream failed",
            AbortCode::Internal => "internal error",
        }
    }
}

impl fmt::Display for AbortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Code plus human-readable description of why a block was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortReason {
    pub code: AbortCode,
    pub description: String,
}

impl AbortReason {
    pub fn new(code: AbortCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.description)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_survive_the_wire() {
        for code in [
            AbortCode::Unknown,
            AbortCode::Cancelled,
            AbortCode::Timeout,
            AbortCode::SenderDied,
            AbortCode::ReceiverUnresponsive,
            AbortCode::Disconnected,
            AbortCode::Restarted,
            AbortCode::Overloaded,
            AbortCode::UpstreamFailed,
            AbortCode::Internal,
        ] {
            assert_eq!(AbortCode::from_u16(code.to_u16()), code);
        }
    }

    #[test]
    fn unrecognised_code_is_unknown() {
        assert_eq!(AbortCode::from_u16(0xbeef), AbortCode::Unknown);
    }

    #[test]
    fn reason_display_omits_empty_description() {
        assert_eq!(AbortReason::new(AbortCode::Timeout, "").to_string(), "timeout");
    }
}
