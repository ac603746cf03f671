//! Identity of the active transform plugin set.

use std::fmt;

use kiln_common::ContentHash;

/// Cache keys longer than this are replaced by a short digest.
const MAX_INLINE_KEY_LEN: usize = 6;

/// Hex digits kept from the digest of a long cache key.
const KEY_DIGEST_LEN: usize = 8;

/// A transform plugin as seen by the cache.
///
/// The cache never runs plugins; it only needs enough identity to tell
/// whether an artifact was produced by the same plugin configuration.
pub trait CachePlugin {
    /// Plugin name. Plugins with an empty name are ignored.
    fn name(&self) -> &str;

    /// Key that changes whenever the plugin's output for the same input
    /// could change (options, versions of tools it wraps).
    fn cache_key(&self) -> Option<String> {
        None
    }
}

/// Deterministic summary of an ordered plugin set.
///
/// Rendered as `name@key` per plugin joined with `" && "`. Any change to the
/// plugin order, names, or cache keys changes the fingerprint and with it the
/// staleness of every cached file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PluginFingerprint(String);

impl PluginFingerprint {
    /// Computes the fingerprint of a plugin set.
    pub fn from_plugins<'a, I>(plugins: I) -> Self
    where
        I: IntoIterator<Item = &'a dyn CachePlugin>,
    {
        let parts: Vec<String> = plugins
            .into_iter()
            .filter(|plugin| !plugin.name().is_empty())
            .map(|plugin| {
                let name = plugin.name();
                match plugin.cache_key() {
                    Some(key) if key.len() > MAX_INLINE_KEY_LEN => format!(
                        "{name}@{}",
                        ContentHash::from_bytes(key.as_bytes()).short(KEY_DIGEST_LEN)
                    ),
                    Some(key) => format!("{name}@{key}"),
                    None => {
                        tracing::warn!(
                            target = "kiln.cache",
                            plugin = name,
                            "plugin does not provide a cache key; option changes will not invalidate the cache"
                        );
                        name.to_string()
                    }
                }
            })
            .collect();
        Self(parts.join(" && "))
    }

    /// Returns the fingerprint string as stored in cache records.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
