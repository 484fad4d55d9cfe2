//! Virtual-host handling for the handshake's server address.
//!
//! Clients and front-ends decorate the address they put in the handshake:
//! - Forge/FML and Floodgate append `\0<token>` after the host.
//! - TCPShield appends `///<clientIp[:port]>///<unixTime>`.
//! - Some clients send a trailing `.` (fully qualified names).

use std::{
    net::{IpAddr, SocketAddr},
    time::{SystemTime, UNIX_EPOCH},
};

pub const FORGE_SEPARATOR: char = '\0';
pub const TCPSHIELD_SEPARATOR: &str = "///";

/// Strips every decoration and returns the lower-cased host.
pub fn clear_virtual_host(addr: &str) -> String {
    let host = addr.split(FORGE_SEPARATOR).next().unwrap_or_default();
    let host = host.split(TCPSHIELD_SEPARATOR).next().unwrap_or_default();
    host.trim_matches('.').to_lowercase()
}

pub fn is_tcpshield_real_ip(addr: &str) -> bool {
    addr.contains(TCPSHIELD_SEPARATOR)
}

/// Extracts the client IP TCPShield put in the address, if present and parseable.
pub fn tcpshield_client_ip(addr: &str) -> Option<IpAddr> {
    let field = addr.split(TCPSHIELD_SEPARATOR).nth(1)?;
    let field = field.split(FORGE_SEPARATOR).next()?.trim();
    if field.is_empty() {
        return None;
    }
    if let Ok(sa) = field.parse::<SocketAddr>() {
        return Some(sa.ip());
    }
    field
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()
}

/// The address the rest of the proxy should treat as the client's.
///
/// With `tcpshield_real_ip` enabled and a TCPShield-decorated address, the embedded IP wins;
/// otherwise (or if it does not parse) the socket's remote IP is used.
pub fn effective_client_ip(addr: &str, remote: SocketAddr, tcpshield_real_ip: bool) -> IpAddr {
    if tcpshield_real_ip && is_tcpshield_real_ip(addr) {
        if let Some(ip) = tcpshield_client_ip(addr) {
            return ip;
        }
    }
    remote.ip()
}

/// Replaces the cleared host inside `addr` with `backend_host`.
///
/// Returns `None` when the host already equals the backend host (ignoring case) or does
/// not occur in `addr`. Matching is ASCII case-insensitive so a mixed-case original host
/// is still replaced.
pub fn modify_virtual_host(addr: &str, backend_host: &str) -> Option<String> {
    let cleared = clear_virtual_host(addr);
    if cleared.is_empty() || cleared.eq_ignore_ascii_case(backend_host) {
        return None;
    }

    // ASCII lowering keeps byte offsets aligned with `addr`.
    let haystack = addr.to_ascii_lowercase();
    let needle = cleared.to_ascii_lowercase();
    let mut out = String::with_capacity(addr.len() + backend_host.len());
    let mut last = 0;
    for (start, _) in haystack.match_indices(&needle) {
        out.push_str(&addr[last..start]);
        out.push_str(backend_host);
        last = start + needle.len();
    }
    if last == 0 {
        return None;
    }
    out.push_str(&addr[last..]);
    Some(out)
}

/// Rewrites a TCPShield address to carry `client` as the real IP and `now` as the timestamp,
/// keeping a trailing Forge token if there was one.
pub fn tcpshield_rewrite(addr: &str, client: SocketAddr, now: SystemTime) -> String {
    let host = clear_virtual_host(addr);
    let unix = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut out = format!("{host}{TCPSHIELD_SEPARATOR}{client}{TCPSHIELD_SEPARATOR}{unix}");

    if let Some((_, forge)) = addr.split_once(FORGE_SEPARATOR) {
        let token = forge.trim_end_matches(FORGE_SEPARATOR);
        if !token.is_empty() {
            out.push(FORGE_SEPARATOR);
            out.push_str(token);
            out.push(FORGE_SEPARATOR);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn forge_suffix_is_stripped() {
        assert_eq!(
            clear_virtual_host("lobby.example.com\0FML2\0"),
            "lobby.example.com"
        );
        assert_eq!(
            clear_virtual_host("lobby.example.com\0FML2"),
            "lobby.example.com"
        );
    }

    #[test]
    fn floodgate_payload_is_stripped() {
        let addr = "Lobby.Example.com\0\u{1}\u{7f}binary-looking-payload==";
        assert_eq!(clear_virtual_host(addr), "lobby.example.com");
    }

    #[test]
    fn tcpshield_and_dots_are_stripped() {
        assert_eq!(
            clear_virtual_host("play.example.com.///198.51.100.5:41234///1700000000"),
            "play.example.com"
        );
        assert_eq!(clear_virtual_host("..a.b.."), "a.b");
    }

    #[test]
    fn tcpshield_client_ip_extraction() {
        let addr = "play.example.com///198.51.100.5:41234///1700000000";
        let remote: SocketAddr = "203.0.113.2:25565".parse().expect("addr");

        assert!(is_tcpshield_real_ip(addr));
        assert_eq!(
            effective_client_ip(addr, remote, true),
            "198.51.100.5".parse::<IpAddr>().expect("ip")
        );
        assert_eq!(
            effective_client_ip(addr, remote, false),
            "203.0.113.2".parse::<IpAddr>().expect("ip")
        );
    }

    #[test]
    fn tcpshield_ip_variants() {
        assert_eq!(
            tcpshield_client_ip("h///2001:db8::1///1"),
            Some("2001:db8::1".parse().expect("ip"))
        );
        assert_eq!(
            tcpshield_client_ip("h///[2001:db8::1]:5000///1"),
            Some("2001:db8::1".parse().expect("ip"))
        );
        assert_eq!(
            tcpshield_client_ip("h///10.0.0.7\0FML2\0///1"),
            Some("10.0.0.7".parse().expect("ip"))
        );
        assert_eq!(tcpshield_client_ip("h///not-an-ip///1"), None);
        assert_eq!(tcpshield_client_ip("h"), None);

        let remote: SocketAddr = "203.0.113.2:1".parse().expect("addr");
        assert_eq!(
            effective_client_ip("h///garbage///1", remote, true),
            remote.ip()
        );
    }

    #[test]
    fn modify_virtual_host_replaces_every_occurrence() {
        assert_eq!(
            modify_virtual_host("Play.Example.com\0FML2\0", "backend.local").as_deref(),
            Some("backend.local\0FML2\0")
        );
        assert_eq!(
            modify_virtual_host("a.com///1.2.3.4///1", "b.net").as_deref(),
            Some("b.net///1.2.3.4///1")
        );
        assert_eq!(modify_virtual_host("backend.local", "BACKEND.local"), None);
    }

    #[test]
    fn tcpshield_rewrite_keeps_forge_token() {
        let client: SocketAddr = "203.0.113.2:51000".parse().expect("addr");
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_123);

        assert_eq!(
            tcpshield_rewrite("play.example.com///198.51.100.5:41234///1700000000", client, now),
            "play.example.com///203.0.113.2:51000///1700000123"
        );
        assert_eq!(
            tcpshield_rewrite("Play.example.com///1.1.1.1///1\0FML2\0", client, now),
            "play.example.com///203.0.113.2:51000///1700000123\0FML2\0"
        );
    }

    fn host_like() -> impl Strategy<Value = String> {
        proptest::collection::vec(
            prop_oneof![
                "[a-zA-Z0-9.:-]{0,12}",
                Just("\0".to_string()),
                Just("///".to_string()),
                Just("/".to_string()),
                Just(".".to_string()),
                Just("FML2".to_string()),
            ],
            0..8,
        )
        .prop_map(|parts| parts.concat())
    }

    proptest! {
        #[test]
        fn cleared_host_is_canonical(s in host_like()) {
            let c = clear_virtual_host(&s);
            prop_assert_eq!(c.to_lowercase(), c.clone());
            prop_assert!(!c.contains('\0'));
            prop_assert!(!c.contains("///"));
            prop_assert!(!c.starts_with('.'));
            prop_assert!(!c.ends_with('.'));
        }

        #[test]
        fn clearing_is_idempotent(s in host_like()) {
            let once = clear_virtual_host(&s);
            prop_assert_eq!(clear_virtual_host(&once), once);
        }

        #[test]
        fn clearing_arbitrary_strings_is_idempotent(s in "\\PC{0,40}") {
            let once = clear_virtual_host(&s);
            prop_assert!(!once.contains('\0'));
            prop_assert!(!once.contains("///"));
            prop_assert_eq!(clear_virtual_host(&once), once);
        }
    }
}
