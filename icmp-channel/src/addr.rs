use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// One configured endpoint of the tunnel.
///
/// Stores the textual address with IPv6 literal brackets stripped and
/// projects it into the two shapes socket APIs ask for. Construction never
/// fails: text that does not parse as an IP literal degrades to the
/// unspecified address, and the socket layer reports the real error when it
/// first uses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddr {
    addr: String,
}

impl EndpointAddr {
    pub fn new(addr: impl AsRef<str>) -> Self {
        let addr = addr.as_ref();
        let addr = addr.strip_prefix('[').unwrap_or(addr);
        let addr = addr.strip_suffix(']').unwrap_or(addr);

        Self {
            addr: addr.to_owned(),
        }
    }

    /// The bare-IP shape, for APIs that address by host only.
    pub fn ip(&self) -> IpAddr {
        self.addr
            .parse()
            .unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
    }

    /// The UDP-socket shape with a zero port, for APIs that want a full
    /// socket address even though ICMP has no ports.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), 0)
    }

    pub fn as_str(&self) -> &str {
        &self.addr
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ipv6_literal_brackets() {
        assert_eq!(
            EndpointAddr::new("[2001:db8::1]"),
            EndpointAddr::new("2001:db8::1")
        );
        assert_eq!(EndpointAddr::new("[2001:db8::1]").as_str(), "2001:db8::1");
    }

    #[test]
    fn projections_agree_on_the_ip() {
        let addr = EndpointAddr::new("2001:db8::1");
        let ip = "2001:db8::1".parse::<IpAddr>().unwrap();

        assert_eq!(addr.ip(), ip);
        assert_eq!(addr.socket_addr(), SocketAddr::new(ip, 0));
    }

    #[test]
    fn unparsable_text_degrades_to_unspecified() {
        let addr = EndpointAddr::new("not-an-ip");

        assert_eq!(addr.ip(), IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        assert_eq!(addr.socket_addr().port(), 0);
    }
}
