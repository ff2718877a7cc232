use std::{borrow::Cow, net::SocketAddrV4, sync::LazyLock};

use regex::Regex;

/// Normalize a bind/listen address.
///
/// Configs use the shorthand `":PORT"` for "all interfaces", which
/// `SocketAddr` parsing does not accept.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Longest valid `a.b.c.d:port` string.
pub const MAX_ENDPOINT_LEN: usize = 21;

static ENDPOINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3}):(\d{1,5})$").expect("endpoint regex")
});

/// Strict `IPv4:port` check for rendezvous session keys.
///
/// Rejects anything that is not four decimal octets and a decimal port,
/// out-of-range values, leading zeros in octets and port `0`.
pub fn parse_ipv4_endpoint(s: &str) -> Option<SocketAddrV4> {
    if s.len() > MAX_ENDPOINT_LEN || !ENDPOINT_RE.is_match(s) {
        return None;
    }
    let addr: SocketAddrV4 = s.parse().ok()?;
    if addr.port() == 0 {
        return None;
    }
    // Round-trip guards against forms the std parser tolerates but we do not
    // want as map keys (e.g. leading zeros in the port).
    if addr.to_string() != s {
        return None;
    }
    Some(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
        assert_eq!(normalize_bind_addr("127.0.0.1:80").as_ref(), "127.0.0.1:80");
    }

    #[test]
    fn endpoint_accepts_canonical_ipv4() {
        let a = parse_ipv4_endpoint("203.0.113.7:41000").unwrap();
        assert_eq!(a.port(), 41000);
        assert!(parse_ipv4_endpoint("255.255.255.255:65535").is_some());
    }

    #[test]
    fn endpoint_rejects_malformed() {
        for bad in [
            "999.999.999.999:70000",
            "1.2.3.4",
            "1.2.3:80",
            "1.2.3.4:0",
            "1.2.3.4:080",
            "01.2.3.4:80",
            "1.2.3.4:65536",
            "[::1]:80",
            "host:80",
            " 1.2.3.4:80",
            "1.2.3.4:80/x",
            "",
        ] {
            assert!(parse_ipv4_endpoint(bad).is_none(), "{bad} should be rejected");
        }
    }
}
