//! Pairing Token
//!
//! Der QR-Code eines Geräts enthält `lancall://<ipv4>:<port>`.
//! Erlaubt sind genau vier Oktette (0-255, 1-3 Ziffern) und ein Port 1-65535.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use thiserror::Error;

pub const TOKEN_SCHEME: &str = "lancall://";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token must start with lancall://")]
    MissingScheme,

    #[error("Expected <ipv4>:<port>, got '{0}'")]
    MalformedAddress(String),

    #[error("Invalid IPv4 address '{0}'")]
    InvalidAddress(String),

    #[error("Invalid port '{0}'")]
    InvalidPort(String),
}

/// Adresse eines Peers, wie sie im QR-Code steht
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingToken {
    ip: Ipv4Addr,
    port: u16,
}

impl PairingToken {
    /// Validiert eine IP/Port-Kombination aus anderer Quelle als einem Token
    pub fn from_parts(ip: &str, port: u32) -> Result<Self, TokenError> {
        let ip = parse_ipv4(ip)?;
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| TokenError::InvalidPort(port.to_string()))?;
        Ok(Self { ip, port })
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// IP in Dotted-Quad-Notation
    pub fn host(&self) -> String {
        self.ip.to_string()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl FromStr for PairingToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = s
            .trim()
            .strip_prefix(TOKEN_SCHEME)
            .ok_or(TokenError::MissingScheme)?;

        let (ip, port) = address
            .split_once(':')
            .filter(|(_, port)| !port.contains(':'))
            .ok_or_else(|| TokenError::MalformedAddress(address.to_string()))?;

        let ip = parse_ipv4(ip)?;
        let invalid_port = || TokenError::InvalidPort(port.to_string());
        // Nur Ziffern, `u16::from_str` allein nimmt auch ein `+` an
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid_port());
        }
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(invalid_port)?;

        Ok(Self { ip, port })
    }
}

impl fmt::Display for PairingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", TOKEN_SCHEME, self.ip, self.port)
    }
}

/// Strikte Dotted-Quad-Prüfung (keine Vorzeichen, keine Leerzeichen)
pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr, TokenError> {
    let invalid = || TokenError::InvalidAddress(s.to_string());

    let mut octets = [0u8; 4];
    let mut parts = s.split('.');
    for octet in octets.iter_mut() {
        let part = parts.next().ok_or_else(invalid)?;
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        *octet = part.parse::<u8>().map_err(|_| invalid())?;
    }

    if parts.next().is_some() {
        return Err(invalid());
    }

    Ok(Ipv4Addr::from(octets))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_token() {
        let token: PairingToken = "lancall://192.168.1.10:10001".parse().unwrap();
        assert_eq!(token.host(), "192.168.1.10");
        assert_eq!(token.port(), 10001);
        assert_eq!(token.to_string(), "lancall://192.168.1.10:10001");
    }

    #[test]
    fn test_reject_invalid_octet() {
        assert_eq!(
            "lancall://999.1.1.1:10001".parse::<PairingToken>(),
            Err(TokenError::InvalidAddress("999.1.1.1".to_string()))
        );
    }

    #[test]
    fn test_reject_signed_port() {
        assert_eq!(
            "lancall://1.2.3.4:+10001".parse::<PairingToken>(),
            Err(TokenError::InvalidPort("+10001".to_string()))
        );
        assert_eq!(
            "lancall://1.2.3.4:".parse::<PairingToken>(),
            Err(TokenError::InvalidPort(String::new()))
        );
    }

    #[test]
    fn test_reject_invalid_port() {
        assert_eq!(
            "lancall://1.2.3.4:70000".parse::<PairingToken>(),
            Err(TokenError::InvalidPort("70000".to_string()))
        );
        assert!("lancall://1.2.3.4:0".parse::<PairingToken>().is_err());
        assert!("lancall://1.2.3.4:".parse::<PairingToken>().is_err());
    }

    #[test]
    fn test_reject_malformed_tokens() {
        for token in [
            "http://1.2.3.4:10001",
            "lancall://1.2.3:10001",
            "lancall://1.2.3.4.5:10001",
            "lancall://1.2.3.4",
            "lancall://1.2.3.4:10001:1",
            "lancall://1.2.-3.4:10001",
            "lancall://1.2. 3.4:10001",
            "lancall://a.b.c.d:10001",
        ] {
            assert!(token.parse::<PairingToken>().is_err(), "{} accepted", token);
        }
    }

    #[test]
    fn test_from_parts() {
        let token = PairingToken::from_parts("10.0.0.5", 10001).unwrap();
        assert_eq!(token.socket_addr(), "10.0.0.5:10001".parse().unwrap());
        assert!(PairingToken::from_parts("10.0.0.256", 10001).is_err());
        assert!(PairingToken::from_parts("10.0.0.5", 65536).is_err());
    }
}
