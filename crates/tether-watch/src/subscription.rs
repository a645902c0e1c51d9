// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Subscription identity.

use std::sync::Arc;

use rand::RngCore;

use tether_events::NotificationSink;

/// Lowercase RFC 4648 base32, no padding.
const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// A new subscription id: the kind prefix followed by 10 lowercase base32
/// characters derived from 6 random bytes.
pub fn new_subscription_id(prefix: &str) -> String {
    let mut bytes = [0u8; 6];
    rand::rngs::OsRng.fill_bytes(&mut bytes);

    let mut acc: u64 = 0;
    for b in bytes {
        acc = (acc << 8) | u64::from(b);
    }
    // 48 bits, left-aligned into 10 five-bit groups.
    acc <<= 2;

    let mut out = String::with_capacity(prefix.len() + 10);
    out.push_str(prefix);
    for i in (0..10).rev() {
        out.push(ALPHABET[((acc >> (i * 5)) & 31) as usize] as char);
    }
    out
}

/// One live subscription: the stable id plus its delivery sink.
#[derive(Clone)]
pub struct Subscriber {
    pub id: String,
    pub sink: Arc<dyn NotificationSink>,
}

impl Subscriber {
    pub fn new(id: impl Into<String>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            id: id.into(),
            sink,
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefix_and_10_base32_chars() {
        let id = new_subscription_id("w_");
        assert!(id.starts_with("w_"));
        let suffix = &id["w_".len()..];
        assert_eq!(suffix.len(), 10);
        assert!(suffix.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(new_subscription_id("g_")));
        }
    }
}
