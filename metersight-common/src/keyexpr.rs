use crate::error::{Error, Result};

/// Default key expression prefix for meter telemetry.
pub const KEY_PREFIX: &str = "meter/telstar80a";

/// Chunk reserved for the per-cycle aggregate message.
pub const SNAPSHOT_CHUNK: &str = "snapshot";

/// Builder for constructing meter topic key expressions.
///
/// Topics follow the pattern `<prefix>/<register>`, with the aggregate
/// published on `<prefix>/snapshot` and bridge status on `<prefix>/@/status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    prefix: String,
}

impl TopicBuilder {
    /// Create a builder for a validated prefix.
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        Ok(Self { prefix })
    }

    /// The key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key expression for an individual register.
    ///
    /// # Example
    /// ```
    /// use metersight_common::keyexpr::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("meter/telstar80a").unwrap();
    /// assert_eq!(topics.register("voltage_l1_mV"), "meter/telstar80a/voltage_l1_mV");
    /// ```
    pub fn register(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    /// Key expression for the per-cycle aggregate.
    ///
    /// # Example
    /// ```
    /// use metersight_common::keyexpr::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("meter/telstar80a").unwrap();
    /// assert_eq!(topics.snapshot(), "meter/telstar80a/snapshot");
    /// ```
    pub fn snapshot(&self) -> String {
        format!("{}/{}", self.prefix, SNAPSHOT_CHUNK)
    }

    /// Key expression for bridge status.
    pub fn status(&self) -> String {
        format!("{}/@/status", self.prefix)
    }

    /// Wildcard covering every topic under the prefix.
    pub fn wildcard(&self) -> String {
        format!("{}/**", self.prefix)
    }

    /// Extract the register name from a full key expression.
    ///
    /// Returns `None` for the aggregate, status keys, or foreign prefixes.
    pub fn parse_register<'a>(&self, key: &'a str) -> Option<&'a str> {
        let rest = key.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        if rest.is_empty() || rest.contains('/') || rest == SNAPSHOT_CHUNK {
            return None;
        }
        Some(rest)
    }
}

impl Default for TopicBuilder {
    fn default() -> Self {
        Self {
            prefix: KEY_PREFIX.to_string(),
        }
    }
}

/// Check whether a single chunk is usable verbatim inside a key expression.
pub fn is_valid_chunk(chunk: &str) -> bool {
    !chunk.is_empty()
        && !chunk.starts_with('@')
        && !chunk.chars().any(|c| matches!(c, '/' | '*' | '$' | '?' | '#'))
}

/// Validate a publish prefix: slash-separated, non-empty chunks, no wildcards.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(Error::KeyExpr("prefix cannot be empty".to_string()));
    }

    for chunk in prefix.split('/') {
        if !is_valid_chunk(chunk) {
            return Err(Error::KeyExpr(format!(
                "invalid chunk '{}' in prefix '{}'",
                chunk, prefix
            )));
        }
    }

    Ok(())
}
