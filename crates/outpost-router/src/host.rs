//! Hostname canonicalization and subdomain generation

use rand::Rng;

/// Canonicalize a host for fingerprinting: trim, strip any port, lowercase.
///
/// Handles bracketed IPv6 literals (`[::1]:443`) even though tunnels are
/// keyed by name in practice.
pub fn canonical_host(raw: &str) -> String {
    let host = raw.trim();

    let host = if let Some(stripped) = host.strip_prefix('[') {
        // IPv6 literal: everything up to the closing bracket
        stripped.split(']').next().unwrap_or(stripped)
    } else {
        host.split(':').next().unwrap_or(host)
    };

    host.trim_end_matches('.').to_ascii_lowercase()
}

const SUBDOMAIN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUBDOMAIN_LEN: usize = 8;

/// Generate a random subdomain label for tunnels that did not request one
pub fn random_subdomain() -> String {
    let mut rng = rand::thread_rng();
    (0..SUBDOMAIN_LEN)
        .map(|i| {
            // First character stays alphabetic so the label never looks numeric
            let charset = if i == 0 {
                &SUBDOMAIN_CHARSET[..26]
            } else {
                SUBDOMAIN_CHARSET
            };
            charset[rng.gen_range(0..charset.len())] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_host_strips_port() {
        assert_eq!(canonical_host("demo.example.com:8080"), "demo.example.com");
        assert_eq!(canonical_host("demo.example.com"), "demo.example.com");
    }

    #[test]
    fn test_canonical_host_lowercases() {
        assert_eq!(canonical_host("Demo.Example.COM"), "demo.example.com");
    }

    #[test]
    fn test_canonical_host_trims() {
        assert_eq!(canonical_host("  demo.example.com \r"), "demo.example.com");
        assert_eq!(canonical_host("demo.example.com."), "demo.example.com");
    }

    #[test]
    fn test_canonical_host_ipv6() {
        assert_eq!(canonical_host("[::1]:443"), "::1");
    }

    #[test]
    fn test_random_subdomain_shape() {
        for _ in 0..100 {
            let label = random_subdomain();
            assert_eq!(label.len(), 8);
            assert!(label.chars().next().unwrap().is_ascii_lowercase());
            assert!(label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_random_subdomains_differ() {
        let a = random_subdomain();
        let b = random_subdomain();
        // Collisions over a 36^8 space are vanishingly unlikely
        assert_ne!(a, b);
    }
}
