//! Resource key generation.

use crate::error::{Result, WindowgateError};

/// Separator between the namespace and the id.
const SEPARATOR: char = ':';

/// Check that `namespace` can prefix a key unambiguously.
///
/// The namespace must be non-empty and must not contain the separator,
/// otherwise `("a:b", "c")` and `("a", "b:c")` would share a window.
pub(crate) fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() {
        return Err(WindowgateError::Config(
            "rate limit namespace must not be empty".to_string(),
        ));
    }
    if namespace.contains(SEPARATOR) {
        return Err(WindowgateError::Config(format!(
            "rate limit namespace '{}' must not contain '{}'",
            namespace, SEPARATOR
        )));
    }
    Ok(())
}

/// A key that identifies one rate-limited resource.
///
/// The key is composed of a namespace and the resource id as
/// `"<namespace>:<id>"`. The namespace keeps limiters that share a store
/// (for example `webhook` and `endpoint`) from counting into each other's
/// windows. The string is also the wire format of the key in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    key: String,
    namespace_len: usize,
}

impl ResourceKey {
    /// Create a key for `id` within `namespace`.
    ///
    /// An empty id is a [`WindowgateError::MissingKey`]: requests that carry
    /// no identifier must be rejected, never pooled under a shared key. The id
    /// may contain `:`, the namespace may not.
    pub fn new(namespace: &str, id: &str) -> Result<Self> {
        validate_namespace(namespace)?;
        if id.trim().is_empty() {
            return Err(WindowgateError::MissingKey(format!(
                "no resource id for namespace '{}'",
                namespace
            )));
        }

        Ok(Self {
            key: format!("{}{}{}", namespace, SEPARATOR, id),
            namespace_len: namespace.len(),
        })
    }

    /// The namespace part of the key.
    pub fn namespace(&self) -> &str {
        &self.key[..self.namespace_len]
    }

    /// The resource id part of the key.
    pub fn id(&self) -> &str {
        &self.key[self.namespace_len + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.key
    }
}
