use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::WireError;

/// Appends the wire encoding of a socket address to `buf`.
///
/// Layout: one byte of address length (4 or 16), the raw address octets,
/// then the port in big-endian.
pub fn encode_endpoint(buf: &mut Vec<u8>, endpoint: SocketAddr) {
    match endpoint.ip() {
        IpAddr::V4(addr) => {
            buf.push(4);
            buf.extend_from_slice(&addr.octets());
        }
        IpAddr::V6(addr) => {
            buf.push(16);
            buf.extend_from_slice(&addr.octets());
        }
    }
    buf.extend_from_slice(&endpoint.port().to_be_bytes());
}

/// Reads one endpoint from the front of `data`, returning it together with
/// the number of bytes consumed.
pub fn decode_endpoint(data: &[u8]) -> Result<(SocketAddr, usize), WireError> {
    let Some(&addr_len) = data.first() else {
        return Err(WireError::malformed("empty endpoint"));
    };
    let addr_len = addr_len as usize;
    let total = 1 + addr_len + 2;
    if data.len() < total {
        return Err(WireError::malformed("truncated endpoint"));
    }

    let ip = match addr_len {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&data[1..5]);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[1..17]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(WireError::malformed("unsupported address length")),
    };
    let port = u16::from_be_bytes([data[1 + addr_len], data[2 + addr_len]]);
    Ok((SocketAddr::new(ip, port), total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trip() {
        let endpoint: SocketAddr = "192.0.2.17:4433".parse().unwrap();
        let mut buf = Vec::new();
        encode_endpoint(&mut buf, endpoint);
        assert_eq!(buf.len(), 7);
        let (decoded, used) = decode_endpoint(&buf).unwrap();
        assert_eq!(decoded, endpoint);
        assert_eq!(used, 7);
    }

    #[test]
    fn v6_round_trip() {
        let endpoint: SocketAddr = "[2001:db8::42]:9000".parse().unwrap();
        let mut buf = Vec::new();
        encode_endpoint(&mut buf, endpoint);
        assert_eq!(buf.len(), 19);
        let (decoded, used) = decode_endpoint(&buf).unwrap();
        assert_eq!(decoded, endpoint);
        assert_eq!(used, 19);
    }

    #[test]
    fn consumed_length_supports_concatenation() {
        let first: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let second: SocketAddr = "[::1]:2".parse().unwrap();
        let mut buf = Vec::new();
        encode_endpoint(&mut buf, first);
        encode_endpoint(&mut buf, second);

        let (a, used) = decode_endpoint(&buf).unwrap();
        let (b, _) = decode_endpoint(&buf[used..]).unwrap();
        assert_eq!(a, first);
        assert_eq!(b, second);
    }

    #[test]
    fn bogus_address_length_is_rejected() {
        assert!(decode_endpoint(&[5, 1, 2, 3, 4, 5, 0, 80]).is_err());
        assert!(decode_endpoint(&[]).is_err());
        assert!(decode_endpoint(&[4, 1, 2, 3]).is_err());
    }
}
