//! Deterministic, prefix-preserving key fingerprinting.
//!
//! A query or mutation is addressed by an ordered tuple of key parts, e.g.
//! `("user", 42)` or `("posts", "page", 3)`. [`hash_key`] renders that tuple
//! into a single canonical string (the *fingerprint* used as the provider
//! topic and the cache backend key), such that the fingerprint of any prefix
//! of the tuple is itself a string prefix of the fingerprint of the whole
//! tuple. That property is what makes prefix invalidation
//! (`CacheManager::invalidate`) correct: deleting every backend key with
//! `hash_key(prefix)` as a string prefix deletes exactly the entries whose
//! key tuple has `prefix` as a tuple prefix.

use std::fmt::Display;

/// Separator between encoded key parts.
///
/// Chosen so that it cannot appear inside an encoded part: every part is
/// escaped before being joined (see [`encode_part`]), so a legitimate part's
/// encoding never contains an unescaped `:`. This is what keeps the hasher
/// prefix-preserving: one part's encoding can never merge with the next
/// part's encoding in a way that would make two distinct key tuples collide
/// on a shared fingerprint prefix.
const SEPARATOR: char = ':';

/// An ordered tuple of key parts.
///
/// Implemented for `Vec<String>` and fixed-size arrays of `String`; most
/// callers will just build a `Vec<String>` from `format!(...)` calls.
pub trait KeyTuple {
    /// The ordered, rendered parts of this key.
    fn parts(&self) -> Vec<String>;
}

impl KeyTuple for Vec<String> {
    fn parts(&self) -> Vec<String> {
        self.clone()
    }
}

impl KeyTuple for &[String] {
    fn parts(&self) -> Vec<String> {
        self.to_vec()
    }
}

impl<const N: usize> KeyTuple for [String; N] {
    fn parts(&self) -> Vec<String> {
        self.to_vec()
    }
}

/// Escape a single key part so the separator cannot occur unescaped.
///
/// `:` becomes `\:` and `\` becomes `\\`; this is a two-character escape
/// table, not a general-purpose encoder, which keeps encoding (and the
/// prefix-preservation argument above) trivial to audit.
fn encode_part(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for ch in part.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            SEPARATOR => out.push_str("\\:"),
            other => out.push(other),
        }
    }
    out
}

/// Render one `Display`-able key element with the canonical escaping.
pub fn encode_element(element: &dyn Display) -> String {
    encode_part(&element.to_string())
}

/// Compute the deterministic fingerprint of a key tuple.
///
/// Prefix-preserving: for any tuple `a` that is an element-wise prefix of
/// tuple `b`, `hash_key(a)` is a string prefix of `hash_key(b)`.
///
/// Every encoded part is followed by a separator, *including the last one*.
/// Without the trailing separator, `hash_key(["u"]) = "u"` would be a string
/// prefix of `hash_key(["u1", "x"]) = "u1:x"` even though `["u"]` is not a
/// tuple-prefix of `["u1", "x"]`; the trailing separator makes the boundary
/// between one part and the next always explicit, so a string-prefix match
/// can only ever land on a part boundary.
pub fn hash_key<K: KeyTuple>(key: &K) -> String {
    let mut out = String::new();
    for part in key.parts() {
        out.push_str(&encode_part(&part));
        out.push(SEPARATOR);
    }
    out
}

/// Compute the fingerprint of a key tuple built directly from `Display`
/// elements, without an intermediate `Vec<String>` allocation by the caller.
pub fn hash_elements(elements: &[&dyn Display]) -> String {
    let mut out = String::new();
    for element in elements {
        out.push_str(&encode_element(*element));
        out.push(SEPARATOR);
    }
    out
}

/// A pluggable key-fingerprinting strategy, overridable via a controller's
/// `keyHashFn` slot (see §4.7 of the design).
pub trait KeyHasher<K>: Send + Sync {
    fn hash(&self, key: &K) -> String;
}

/// The default hasher, delegating to [`hash_key`].
#[derive(Clone, Copy, Default)]
pub struct DefaultKeyHasher;

impl<K: KeyTuple> KeyHasher<K> for DefaultKeyHasher {
    fn hash(&self, key: &K) -> String {
        hash_key(key)
    }
}

impl<K, F> KeyHasher<K> for F
where
    F: Fn(&K) -> String + Send + Sync,
{
    fn hash(&self, key: &K) -> String {
        self(key)
    }
}
