use std::net::SocketAddr;

/// A 64-bit hash of a TCP 4-tuple, symmetric across direction so that both
/// legs of a bidirectional flow land on the same key.
pub fn flow_hash(src: SocketAddr, dst: SocketAddr) -> u64 {
    let (lo, hi) = if src <= dst { (src, dst) } else { (dst, src) };

    let mut bytes = Vec::with_capacity(16);
    match lo {
        SocketAddr::V4(a) => bytes.extend_from_slice(&a.ip().octets()),
        SocketAddr::V6(a) => bytes.extend_from_slice(&a.ip().octets()),
    }
    bytes.extend_from_slice(&lo.port().to_be_bytes());
    match hi {
        SocketAddr::V4(a) => bytes.extend_from_slice(&a.ip().octets()),
        SocketAddr::V6(a) => bytes.extend_from_slice(&a.ip().octets()),
    }
    bytes.extend_from_slice(&hi.port().to_be_bytes());

    xxhash_rust::xxh3::xxh3_64(&bytes)
}
