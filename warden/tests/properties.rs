//! Property tests for the pure allocation helpers.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use warden::host::generate_uuid;
use warden::net::alloc::{allocate_ip4, derive_ip6, embedded_ip4};

proptest! {
    #[test]
    fn uuid_never_collides_with_existing(seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        // build a large existing set from the same generator
        let mut existing = HashSet::new();
        for _ in 0..10_000 {
            let id = generate_uuid(&existing, 64, &mut rng).unwrap();
            prop_assert!(!existing.contains(&id));
            existing.insert(id);
        }
        let fresh = generate_uuid(&existing, 1_000_000, &mut rng).unwrap();
        prop_assert!(!existing.contains(&fresh));
    }

    #[test]
    fn allocation_never_returns_in_use(seed: u64, used in proptest::collection::hash_set(0u32..1024, 0..200)) {
        let mut rng = StdRng::seed_from_u64(seed);
        let network = u32::from(Ipv4Addr::new(10, 99, 0, 0));
        let in_use: HashSet<Ipv4Addr> =
            used.iter().map(|o| Ipv4Addr::from(network | o)).collect();
        if let Ok(ip) = allocate_ip4(Ipv4Addr::new(10, 99, 0, 0), 22, &in_use, 4096, &mut rng) {
            prop_assert!(!in_use.contains(&ip));
        }
    }

    #[test]
    fn ip6_derivation_is_deterministic_and_reversible(a: u8, b: u8, c: u8, d: u8) {
        let ip4 = Ipv4Addr::new(a, b, c, d);
        prop_assert_eq!(derive_ip6(ip4), derive_ip6(ip4));
        prop_assert_eq!(embedded_ip4(derive_ip6(ip4)), Some(ip4));
    }
}

#[test]
fn single_free_slot_in_a_small_pool_is_found() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut in_use = HashSet::new();
    // /29 has six usable hosts; occupy all but .5
    for host in [1u32, 2, 3, 4, 6] {
        in_use.insert(Ipv4Addr::from(u32::from(Ipv4Addr::new(10, 99, 0, 0)) | host));
    }
    let ip = allocate_ip4(Ipv4Addr::new(10, 99, 0, 0), 29, &in_use, 4096, &mut rng).unwrap();
    assert_eq!(ip, Ipv4Addr::new(10, 99, 0, 5));
}
