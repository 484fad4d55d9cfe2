use std::{borrow::Cow, net::SocketAddr};

pub const DEFAULT_MINECRAFT_PORT: u16 = 25565;

/// Normalize a bind/listen address.
///
/// `":PORT"` means all interfaces; Tokio does not accept it, so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

fn needs_port(addr: &str) -> bool {
    let after = match addr.rfind(']') {
        Some(pos) => &addr[pos + 1..],
        None => addr,
    };
    !after.contains(':')
}

/// Canonical `host:port` form of a backend address, appending `default_port` when absent.
pub fn with_default_port(addr: &str, default_port: u16) -> String {
    let addr = addr.trim();
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return sa.to_string();
    }
    // Bare IPv6 literal.
    if let Ok(ip) = addr.parse::<std::net::Ipv6Addr>() {
        return SocketAddr::from((ip, default_port)).to_string();
    }
    if needs_port(addr) {
        return format!("{addr}:{default_port}");
    }
    addr.to_string()
}

/// Host part of a `host[:port]` address, without IPv6 brackets.
pub fn host_str(addr: &str) -> &str {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    if addr.matches(':').count() > 1 {
        // Unbracketed IPv6 literal.
        return addr;
    }
    match addr.rsplit_once(':') {
        Some((host, _)) => host,
        None => addr,
    }
}

/// Whether `addr` is a syntactically usable `host[:port]` backend address.
pub fn is_valid_backend_addr(addr: &str) -> bool {
    let canonical = with_default_port(addr, DEFAULT_MINECRAFT_PORT);
    if canonical.parse::<SocketAddr>().is_ok() {
        return true;
    }
    let Some((host, port)) = canonical.rsplit_once(':') else {
        return false;
    };
    !host.is_empty()
        && port.parse::<u16>().is_ok()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}
