//! HAProxy PROXY protocol v2 header (binary form) sent ahead of the handshake.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

const VERSION_PROXY: u8 = 0x21;
const TCP_OVER_IPV4: u8 = 0x11;
const TCP_OVER_IPV6: u8 = 0x21;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

impl ProxyHeader {
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Encodes as IPv4 when both ends are IPv4, otherwise as IPv6 with v4-mapped addresses.
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(SIGNATURE.len() + 4 + 36);
        out.put_slice(&SIGNATURE);
        out.put_u8(VERSION_PROXY);

        match (self.source.ip(), self.destination.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                out.put_u8(TCP_OVER_IPV4);
                out.put_u16(12);
                out.put_slice(&src.octets());
                out.put_slice(&dst.octets());
            }
            (src, dst) => {
                out.put_u8(TCP_OVER_IPV6);
                out.put_u16(36);
                out.put_slice(&to_v6(src).octets());
                out.put_slice(&to_v6(dst).octets());
            }
        }
        out.put_u16(self.source.port());
        out.put_u16(self.destination.port());
        out
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, wr: &mut W) -> std::io::Result<()> {
        wr.write_all(&self.encode()).await
    }
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_header_bytes() {
        let h = ProxyHeader::new(
            "198.51.100.5:51000".parse().expect("addr"),
            "10.0.0.1:25565".parse().expect("addr"),
        );
        let b = h.encode();
        assert_eq!(&b[..12], &SIGNATURE);
        assert_eq!(b[12], 0x21);
        assert_eq!(b[13], 0x11);
        assert_eq!(&b[14..16], &[0, 12]);
        assert_eq!(&b[16..20], &[198, 51, 100, 5]);
        assert_eq!(&b[20..24], &[10, 0, 0, 1]);
        assert_eq!(&b[24..26], &51000u16.to_be_bytes());
        assert_eq!(&b[26..28], &25565u16.to_be_bytes());
        assert_eq!(b.len(), 28);
    }

    #[test]
    fn mixed_families_use_ipv6_block() {
        let h = ProxyHeader::new(
            "198.51.100.5:1".parse().expect("addr"),
            "[2001:db8::1]:25565".parse().expect("addr"),
        );
        let b = h.encode();
        assert_eq!(b[13], 0x21);
        assert_eq!(&b[14..16], &[0, 36]);
        let src: [u8; 16] = b[16..32].try_into().expect("16 bytes");
        assert_eq!(
            Ipv6Addr::from(src),
            "::ffff:198.51.100.5".parse::<Ipv6Addr>().expect("ip")
        );
        assert_eq!(b.len(), 16 + 36);
    }

    #[tokio::test]
    async fn write_to_emits_encoded_header() {
        let h = ProxyHeader::new(
            "127.0.0.1:1".parse().expect("addr"),
            "127.0.0.1:2".parse().expect("addr"),
        );
        let mut out = Vec::new();
        h.write_to(&mut out).await.expect("write");
        assert_eq!(out, h.encode().to_vec());
    }
}
