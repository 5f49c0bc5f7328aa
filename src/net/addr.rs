use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Typed IPv4/IPv6 endpoint.
///
/// Ports are host order at this API; conversion to wire order happens inside
/// the socket layer. The text form is `ip:port` for IPv4 and `[ip]:port`
/// for IPv6, and parsing accepts either family.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct InetAddr(SocketAddr);

impl InetAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        InetAddr(SocketAddr::new(ip, port))
    }

    /// Wildcard IPv4 endpoint (`0.0.0.0:port`).
    pub fn any(port: u16) -> Self {
        InetAddr(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Wildcard IPv6 endpoint (`[::]:port`).
    pub fn any_v6(port: u16) -> Self {
        InetAddr(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port))
    }

    /// IPv4 loopback endpoint (`127.0.0.1:port`).
    pub fn loopback(port: u16) -> Self {
        InetAddr(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    /// Resolve `host` (a hostname or address literal) and `port` into
    /// endpoints. DNS failures and empty results surface as `Error::Addr`.
    pub fn resolve(host: &str, port: u16) -> Result<Vec<InetAddr>> {
        let addrs: Vec<InetAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Addr(format!("cannot resolve {host}: {e}")))?
            .map(InetAddr)
            .collect();
        if addrs.is_empty() {
            return Err(Error::Addr(format!("{host} resolved to no addresses")));
        }
        Ok(addrs)
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn is_ipv4(&self) -> bool {
        self.0.is_ipv4()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for InetAddr {
    fn from(addr: SocketAddr) -> Self {
        InetAddr(addr)
    }
}

impl FromStr for InetAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<SocketAddr>()
            .map(InetAddr)
            .map_err(|e| Error::Addr(format!("invalid endpoint {s:?}: {e}")))
    }
}

impl fmt::Display for InetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v4() {
        let addr: InetAddr = "192.168.1.9:8000".parse().unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 8000);
        assert_eq!(addr.to_string(), "192.168.1.9:8000");
    }

    #[test]
    fn test_parse_v6() {
        let addr: InetAddr = "[2001:db8::1]:443".parse().unwrap();
        assert!(!addr.is_ipv4());
        assert_eq!(addr.port(), 443);
        assert_eq!(addr.to_string(), "[2001:db8::1]:443");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("not-an-endpoint".parse::<InetAddr>().is_err());
        assert!("300.1.1.1:80".parse::<InetAddr>().is_err());
    }

    #[test]
    fn test_wildcards() {
        assert_eq!(InetAddr::any(0).to_string(), "0.0.0.0:0");
        assert_eq!(InetAddr::any_v6(0).to_string(), "[::]:0");
        assert_eq!(InetAddr::loopback(80).to_string(), "127.0.0.1:80");
    }

    #[test]
    fn test_resolve_literal() {
        let addrs = InetAddr::resolve("127.0.0.1", 9000).unwrap();
        assert_eq!(addrs[0], InetAddr::loopback(9000));
    }
}
