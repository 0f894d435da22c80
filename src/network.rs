//! Lokale Adresse
//!
//! Die eigene IPv4 wird für `fromIp`, den Pairing-Token und das
//! `ConnectionAck` gebraucht. Ermittelt wird sie über eine "verbundene"
//! UDP-Socket: dabei wird kein Paket gesendet, das OS wählt nur die Route.

use std::net::{IpAddr, UdpSocket};

/// Liefert die IPv4-Adresse dieses Geräts im LAN
pub trait LocalAddress: Send + Sync {
    fn local_ipv4(&self) -> Option<String>;
}

/// Ermittelt die Adresse über die Routing-Tabelle des Systems
#[derive(Debug, Clone, Default)]
pub struct SystemLocalAddress;

impl LocalAddress for SystemLocalAddress {
    fn local_ipv4(&self) -> Option<String> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("192.168.0.1:9").ok()?;

        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() && !ip.is_loopback() => Some(ip.to_string()),
            _ => {
                tracing::warn!("No LAN IPv4 route available");
                None
            }
        }
    }
}

/// Feste Adresse (Tests, manuell konfigurierte Geräte)
#[derive(Debug, Clone)]
pub struct StaticLocalAddress(pub String);

impl LocalAddress for StaticLocalAddress {
    fn local_ipv4(&self) -> Option<String> {
        Some(self.0.clone())
    }
}
