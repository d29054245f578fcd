//! Address and MAC allocation. Pure functions over an explicit
//! in-use set so callers decide how candidates are drawn and tests can
//! pin the rng.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use rand::Rng;

use crate::errors::{WardenError, WardenResult};

/// Pick a free IPv4 address inside `pool/cidr`, excluding the network
/// and broadcast addresses and everything in `in_use`. Candidates are
/// drawn at random; after `max_retries` misses the pool is declared
/// exhausted rather than looping forever.
pub fn allocate_ip4<R: Rng>(
    pool: Ipv4Addr,
    cidr: u8,
    in_use: &HashSet<Ipv4Addr>,
    max_retries: usize,
    rng: &mut R,
) -> WardenResult<Ipv4Addr> {
    if cidr > 32 {
        return Err(WardenError::Validation(format!("invalid cidr /{}", cidr)));
    }
    if cidr == 32 {
        if in_use.contains(&pool) {
            return Err(WardenError::PoolExhausted(max_retries));
        }
        return Ok(pool);
    }

    let host_bits = 32 - u32::from(cidr);
    let network = u32::from(pool) & mask(cidr);
    let host_count = 1u64 << host_bits;
    if host_count <= 2 {
        // /31: no usable hosts once network and broadcast are excluded
        return Err(WardenError::PoolExhausted(0));
    }

    for _ in 0..max_retries {
        // skip network (offset 0) and broadcast (offset max)
        let offset = rng.random_range(1..host_count - 1) as u32;
        let candidate = Ipv4Addr::from(network | offset);
        if !in_use.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(WardenError::PoolExhausted(max_retries))
}

fn mask(cidr: u8) -> u32 {
    if cidr == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(cidr))
    }
}

/// 6to4-style companion address: 2002::/16 with the IPv4 address in
/// bits 111..80.
pub fn derive_ip6(ip4: Ipv4Addr) -> Ipv6Addr {
    let value = (0x2002u128 << 112) | ((u32::from(ip4) as u128) << 80);
    Ipv6Addr::from(value)
}

/// Recover the IPv4 address embedded by [`derive_ip6`].
pub fn embedded_ip4(ip6: Ipv6Addr) -> Option<Ipv4Addr> {
    let value = u128::from(ip6);
    if value >> 112 != 0x2002 {
        return None;
    }
    Some(Ipv4Addr::from(((value >> 80) & 0xffff_ffff) as u32))
}

/// Random unicast, locally-administered MAC address.
pub fn random_mac<R: Rng>(rng: &mut R) -> String {
    let mut octets = [0u8; 6];
    rng.fill(&mut octets);
    octets[0] = (octets[0] | 0x02) & 0xfe;
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        octets[0], octets[1], octets[2], octets[3], octets[4], octets[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn allocates_inside_pool() {
        let mut rng = StdRng::seed_from_u64(7);
        let in_use = HashSet::new();
        let ip = allocate_ip4(Ipv4Addr::new(10, 99, 0, 0), 16, &in_use, 1024, &mut rng).unwrap();
        let value = u32::from(ip);
        let network = u32::from(Ipv4Addr::new(10, 99, 0, 0));
        assert_eq!(value & 0xffff_0000, network);
        assert_ne!(value & 0xffff, 0);
        assert_ne!(value & 0xffff, 0xffff);
    }

    #[test]
    fn avoids_in_use_addresses() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut in_use = HashSet::new();
        // /30 has exactly two usable hosts; burn one.
        in_use.insert(Ipv4Addr::new(10, 99, 0, 1));
        for _ in 0..50 {
            let ip =
                allocate_ip4(Ipv4Addr::new(10, 99, 0, 0), 30, &in_use, 1024, &mut rng).unwrap();
            assert_eq!(ip, Ipv4Addr::new(10, 99, 0, 2));
        }
    }

    #[test]
    fn exhausted_pool_errors() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut in_use = HashSet::new();
        in_use.insert(Ipv4Addr::new(10, 99, 0, 1));
        in_use.insert(Ipv4Addr::new(10, 99, 0, 2));
        let err =
            allocate_ip4(Ipv4Addr::new(10, 99, 0, 0), 30, &in_use, 64, &mut rng).unwrap_err();
        assert!(matches!(err, WardenError::PoolExhausted(64)));
    }

    #[test]
    fn host_route_returns_pool_address() {
        let mut rng = StdRng::seed_from_u64(7);
        let ip = allocate_ip4(
            Ipv4Addr::new(192, 0, 2, 9),
            32,
            &HashSet::new(),
            16,
            &mut rng,
        )
        .unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 0, 2, 9));
    }

    #[test]
    fn ip6_embeds_and_extracts_ip4() {
        let ip4 = Ipv4Addr::new(10, 99, 12, 34);
        let ip6 = derive_ip6(ip4);
        assert_eq!(embedded_ip4(ip6), Some(ip4));
        assert_eq!(ip6.segments()[0], 0x2002);
    }

    #[test]
    fn mac_is_local_unicast() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let mac = random_mac(&mut rng);
            let first = u8::from_str_radix(&mac[..2], 16).unwrap();
            assert_eq!(first & 0x02, 0x02);
            assert_eq!(first & 0x01, 0x00);
        }
    }

    proptest::proptest! {
        #[test]
        fn ip6_round_trip(a: u8, b: u8, c: u8, d: u8) {
            let ip4 = Ipv4Addr::new(a, b, c, d);
            proptest::prop_assert_eq!(embedded_ip4(derive_ip6(ip4)), Some(ip4));
        }
    }
}
