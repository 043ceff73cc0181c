//! Close status codes as defined in [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).

use std::fmt;

/// Status code carried by a Close frame, indicating why the endpoint is closing the connection.
///
/// Three codes ([`CloseCode::Status`], [`CloseCode::Abnormal`] and [`CloseCode::Tls`]) are
/// reserved by the protocol: they describe a situation observed locally and must never be sent
/// in a Close frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000: the purpose for which the connection was established has been fulfilled.
    Normal,
    /// 1001: an endpoint is going away.
    Away,
    /// 1002: the endpoint is terminating the connection due to a protocol error.
    Protocol,
    /// 1003: the endpoint received a type of data it cannot accept.
    Unsupported,
    /// 1005: no status code was present. Reserved, never sent.
    Status,
    /// 1006: the connection was closed abnormally without a Close frame. Reserved, never sent.
    Abnormal,
    /// 1007: a message contained data inconsistent with its type (e.g. non UTF-8 text).
    Invalid,
    /// 1008: a message violated the endpoint's policy.
    Policy,
    /// 1009: a message was too big to process.
    Size,
    /// 1010: the client expected the server to negotiate an extension.
    Extension,
    /// 1011: the server encountered an unexpected condition.
    Error,
    /// 1012: the server is restarting.
    Restart,
    /// 1013: the server is overloaded, try again later.
    Again,
    /// 1015: the TLS handshake failed. Reserved, never sent.
    Tls,
    /// 1016-2999: reserved for future revisions of the protocol.
    Reserved(u16),
    /// 3000-3999: registered with IANA for libraries and frameworks.
    Iana(u16),
    /// 4000-4999: private use by applications.
    Library(u16),
    /// Anything else, including 0-999 and 1004/1014.
    Bad(u16),
}

impl CloseCode {
    /// Returns `true` if this code may legally appear in a Close frame sent by a peer.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            CloseCode::Bad(_)
                | CloseCode::Reserved(_)
                | CloseCode::Status
                | CloseCode::Abnormal
                | CloseCode::Tls
        )
    }

    /// Returns `true` for the codes that may only be reported locally, never sent.
    pub fn is_receive_only(self) -> bool {
        matches!(self, CloseCode::Status | CloseCode::Abnormal | CloseCode::Tls)
    }

    /// Maps receive-only codes to [`CloseCode::Protocol`] so the result can go on the wire.
    pub fn sendable(self) -> CloseCode {
        if self.is_receive_only() {
            CloseCode::Protocol
        } else {
            self
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1015 => CloseCode::Tls,
            1016..=2999 => CloseCode::Reserved(code),
            3000..=3999 => CloseCode::Iana(code),
            4000..=4999 => CloseCode::Library(code),
            _ => CloseCode::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_known_codes() {
        for code in [
            1000u16, 1001, 1002, 1003, 1005, 1006, 1007, 1008, 1009, 1010, 1011, 1012, 1013, 1015,
            2000, 3500, 4242, 999,
        ] {
            assert_eq!(u16::from(CloseCode::from(code)), code);
        }
    }

    #[test]
    fn test_receive_only_codes() {
        assert!(CloseCode::Status.is_receive_only());
        assert!(CloseCode::Abnormal.is_receive_only());
        assert!(CloseCode::Tls.is_receive_only());
        assert!(!CloseCode::Normal.is_receive_only());

        assert_eq!(CloseCode::Abnormal.sendable(), CloseCode::Protocol);
        assert_eq!(CloseCode::Away.sendable(), CloseCode::Away);
    }

    #[test]
    fn test_allowed_codes() {
        assert!(CloseCode::Normal.is_allowed());
        assert!(CloseCode::Library(4000).is_allowed());
        assert!(!CloseCode::from(1004).is_allowed());
        assert!(!CloseCode::from(2500).is_allowed());
        assert!(!CloseCode::Status.is_allowed());
    }
}
