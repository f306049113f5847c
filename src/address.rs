use anyhow::anyhow;
use std::fmt::{Display, Formatter};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

/// A transport address as used throughout the receive path: either a concrete IP + port,
///  or empty. A receiver's address is empty until `start()` succeeds, and becomes empty
///  again as soon as removal has been requested.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct Address(Option<SocketAddr>);

impl Address {
    pub const fn empty() -> Address {
        Address(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.0
    }

    pub fn port(&self) -> Option<u16> {
        self.0.map(|a| a.port())
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Address {
        Address(Some(addr))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{}", addr),
            None => write!(f, "<none>"),
        }
    }
}

/// A socket address in the form handed over by the OS / reactor: an address family
///  discriminator plus raw bytes. This is untrusted input - `parse()` validates it and
///  can fail on an unknown family, in which case the receive path substitutes an empty
///  address and keeps going.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RawAddress {
    pub family: u8,
    pub port: u16,
    pub octets: [u8; 16],
}

impl RawAddress {
    pub const FAMILY_V4: u8 = 4;
    pub const FAMILY_V6: u8 = 6;

    pub fn parse(&self) -> anyhow::Result<Address> {
        match self.family {
            Self::FAMILY_V4 => {
                let ip = u32::from_be_bytes(self.octets[..4].try_into()?);
                Ok(SocketAddr::V4(SocketAddrV4::new(ip.into(), self.port)).into())
            }
            Self::FAMILY_V6 => {
                let ip = u128::from_be_bytes(self.octets);
                Ok(SocketAddr::V6(SocketAddrV6::new(ip.into(), self.port, 0, 0)).into())
            }
            n => Err(anyhow!("unsupported address family: {}", n)),
        }
    }
}

impl From<SocketAddr> for RawAddress {
    fn from(addr: SocketAddr) -> RawAddress {
        let mut octets = [0u8; 16];
        let family = match addr {
            SocketAddr::V4(a) => {
                octets[..4].copy_from_slice(&a.ip().octets());
                RawAddress::FAMILY_V4
            }
            SocketAddr::V6(a) => {
                octets.copy_from_slice(&a.ip().octets());
                RawAddress::FAMILY_V6
            }
        };
        RawAddress {
            family,
            port: addr.port(),
            octets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::v4("127.0.0.1:9876")]
    #[case::v4_any("0.0.0.0:0")]
    #[case::v6("[2001:db8::1]:8080")]
    #[case::v6_any("[::]:0")]
    fn test_raw_address_round_trip(#[case] addr: &str) {
        let addr: SocketAddr = addr.parse().unwrap();
        let raw = RawAddress::from(addr);
        assert_eq!(raw.parse().unwrap(), Address::from(addr));
    }

    #[rstest]
    #[case::zero(0)]
    #[case::af_unix(1)]
    #[case::garbage(99)]
    fn test_raw_address_unknown_family(#[case] family: u8) {
        let raw = RawAddress {
            family,
            port: 1234,
            octets: [0; 16],
        };
        assert!(raw.parse().is_err());
    }

    #[test]
    fn test_empty_address() {
        let addr = Address::empty();
        assert!(addr.is_empty());
        assert_eq!(addr.socket_addr(), None);
        assert_eq!(addr.port(), None);
        assert_eq!(addr.to_string(), "<none>");
        assert_eq!(addr, Address::default());
    }

    #[test]
    fn test_concrete_address() {
        let socket_addr: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let addr = Address::from(socket_addr);
        assert!(!addr.is_empty());
        assert_eq!(addr.socket_addr(), Some(socket_addr));
        assert_eq!(addr.port(), Some(4000));
        assert_eq!(addr.to_string(), "10.0.0.1:4000");
    }
}
