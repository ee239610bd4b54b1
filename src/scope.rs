//! Target authorization against a scope boundary.
//!
//! A scope is a set of CIDR ranges plus host patterns (exact names or
//! `*.suffix` wildcards). Matching is intentionally best-effort on the
//! parsing side: a malformed CIDR or a non-IP target is a non-match,
//! never an error.

use crate::models::{Scope, User};

/// Decide whether `target` may be scanned under `scope`.
///
/// An elevated caller bypasses the check entirely. A call site without an
/// explicit scope is scope-agnostic and passes.
pub fn authorize(target: &str, scope: Option<&Scope>, user: &User) -> bool {
    if user.is_elevated() {
        return true;
    }
    match scope {
        Some(scope) => target_in_scope(target, scope),
        None => true,
    }
}

/// Check a target string against a scope's host patterns and CIDRs.
pub fn target_in_scope(target: &str, scope: &Scope) -> bool {
    let target = target.trim().to_lowercase();
    if target.is_empty() {
        return false;
    }

    for pattern in &scope.host_patterns {
        if host_matches(&target, &pattern.trim().to_lowercase()) {
            return true;
        }
    }

    if let Some(addr) = parse_ipv4(&target) {
        for cidr in &scope.cidrs {
            if cidr_matches(addr, cidr.trim()) {
                return true;
            }
        }
    }

    false
}

/// Host pattern match: exact equality, or for `*.suffix` patterns the bare
/// suffix itself or any name ending in `.suffix`. `*.example.com` matches
/// `example.com` and `api.example.com` but not `evilexample.com`.
fn host_matches(target: &str, pattern: &str) -> bool {
    if target == pattern {
        return true;
    }
    if let Some(bare) = pattern.strip_prefix("*.") {
        // Suffix including the leading dot, so label boundaries hold.
        let dotted = &pattern[1..];
        return target == bare || target.ends_with(dotted);
    }
    false
}

/// Parse a dotted-quad IPv4 address into its big-endian u32 value.
/// Returns None for anything that is not exactly four octets in 0-255.
fn parse_ipv4(s: &str) -> Option<u32> {
    let mut parts = s.split('.');
    let mut value: u32 = 0;
    for _ in 0..4 {
        let octet: u32 = parts.next()?.parse().ok()?;
        if octet > 255 {
            return None;
        }
        value = (value << 8) | octet;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(value)
}

/// Match an address against one `a.b.c.d/prefix` range. Prefix 0 masks
/// nothing and matches any address. Malformed CIDRs never match.
fn cidr_matches(addr: u32, cidr: &str) -> bool {
    let Some((base, prefix)) = cidr.split_once('/') else {
        return false;
    };
    let Some(base) = parse_ipv4(base) else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u32>() else {
        return false;
    };
    if prefix > 32 {
        return false;
    }
    let mask: u32 = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    (addr & mask) == (base & mask)
}
