//! Tag hashing.
//!
//! Registries never store raw tags unless hashing is disabled. Hashing keeps
//! storage keys short and uniform; it is not meant to be cryptographic or
//! collision-free, only consistent: the same tag always yields the same key.

use std::fmt;
use std::sync::Arc;

/// Signature of a caller-supplied hash generator.
pub type HashFn = dyn Fn(&str) -> String + Send + Sync;

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Tag-to-key transform used by the orchestrator before touching a registry.
#[derive(Clone, Default)]
pub enum TagHasher {
    /// Built-in 32-bit rolling hash rendered in base 36
    #[default]
    Default,
    /// Identity passthrough, keeps stored keys human-readable
    Disabled,
    /// Caller-supplied generator
    Custom(Arc<HashFn>),
}

impl TagHasher {
    /// Build a hasher from a closure.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// `true` selects the built-in hash, `false` disables hashing.
    pub fn from_flag(enabled: bool) -> Self {
        if enabled { Self::Default } else { Self::Disabled }
    }

    /// Hash a single tag.
    pub fn hash(&self, tag: &str) -> String {
        match self {
            Self::Default => default_hash(tag),
            Self::Disabled => tag.to_string(),
            Self::Custom(f) => f(tag),
        }
    }

    /// Hash every tag, preserving order.
    pub fn hash_all(&self, tags: &[String]) -> Vec<String> {
        tags.iter().map(|tag| self.hash(tag)).collect()
    }

    /// Whether stored keys are the raw tags.
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}

impl fmt::Debug for TagHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("TagHasher::Default"),
            Self::Disabled => f.write_str("TagHasher::Disabled"),
            Self::Custom(_) => f.write_str("TagHasher::Custom(..)"),
        }
    }
}

/// Built-in hash: `h = h * 31 + c` over UTF-16 code units in wrapping 32-bit
/// arithmetic, printed as an unsigned base-36 number (at most 7 chars).
///
/// Distinct tags can collide (`"an"` and `"c0"` share a key). A collision only
/// means an invalidation also revalidates the other tag's paths.
pub fn default_hash(tag: &str) -> String {
    let hash = tag.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit))
    });

    to_base36(hash as u32)
}

fn to_base36(mut value: u32) -> String {
    if value == 0 {
        return "0".to_string();
    }

    let mut digits = Vec::with_capacity(7);
    while value > 0 {
        digits.push(BASE36_DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();

    // Only ASCII digits were pushed.
    String::from_utf8(digits).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(default_hash("some-tag"), "ov9e81");
        assert_eq!(default_hash("other-tag"), "12twfh9");
        assert_eq!(default_hash("post:1"), "1is6oyf");
        assert_eq!(default_hash(""), "0");
    }

    #[test]
    fn test_utf16_units() {
        assert_eq!(default_hash("é"), "6h");
    }

    #[test]
    fn test_idempotent() {
        assert_eq!(default_hash("some-tag"), default_hash("some-tag"));
        assert_ne!(default_hash("some-tag"), default_hash("other-tag"));
    }

    #[test]
    fn test_collisions_are_possible() {
        assert_eq!(default_hash("an"), default_hash("c0"));
    }

    #[test]
    fn test_disabled_is_identity() {
        let hasher = TagHasher::Disabled;
        assert_eq!(hasher.hash("some-id"), "some-id");
        assert!(hasher.is_disabled());
    }

    #[test]
    fn test_custom_hasher() {
        let hasher = TagHasher::custom(|_| "tag".to_string());
        assert_eq!(hasher.hash("some-id"), "tag");
    }

    #[test]
    fn test_from_flag() {
        assert!(matches!(TagHasher::from_flag(true), TagHasher::Default));
        assert!(TagHasher::from_flag(false).is_disabled());
    }

    #[test]
    fn test_hash_all_preserves_order() {
        let tags = vec!["b".to_string(), "a".to_string()];
        assert_eq!(TagHasher::Disabled.hash_all(&tags), tags);
        assert_eq!(
            TagHasher::Default.hash_all(&tags),
            vec![default_hash("b"), default_hash("a")]
        );
    }
}
