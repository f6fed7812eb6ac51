//! Ordering configuration of a single hook.

/// How a hook is ordered relative to the other hooks on the same method.
///
/// The chain runs from the call site towards the original code. Higher priorities run earlier,
/// `before` lists ids that must run later than this hook, and `after` lists ids that must run
/// earlier.
///
/// # Examples
///
/// ```rust
/// use detourcore::manager::DetourConfig;
///
/// let config = DetourConfig::new("logging")
///     .with_priority(10)
///     .add_before(["caching"])
///     .add_after(["auth"]);
///
/// assert_eq!(config.id(), "logging");
/// assert_eq!(config.priority(), Some(10));
/// assert_eq!(config.before(), ["caching"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DetourConfig {
    id: String,
    priority: Option<i32>,
    sub_priority: i32,
    before: Vec<String>,
    after: Vec<String>,
}

impl DetourConfig {
    /// Creates a configuration with identity `id` and no ordering constraints.
    pub fn new(id: impl Into<String>) -> Self {
        DetourConfig {
            id: id.into(),
            priority: None,
            sub_priority: 0,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    /// The stable identity other hooks refer to.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The priority, if any.
    #[must_use]
    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    /// Ordering among hooks of equal priority; higher runs earlier.
    #[must_use]
    pub fn sub_priority(&self) -> i32 {
        self.sub_priority
    }

    /// Ids of hooks that run after this one.
    #[must_use]
    pub fn before(&self) -> &[String] {
        &self.before
    }

    /// Ids of hooks that run before this one.
    #[must_use]
    pub fn after(&self) -> &[String] {
        &self.after
    }

    /// Replaces the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: impl Into<Option<i32>>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Replaces the sub-priority.
    #[must_use]
    pub fn with_sub_priority(mut self, sub_priority: i32) -> Self {
        self.sub_priority = sub_priority;
        self
    }

    /// Replaces the ids this hook runs before.
    #[must_use]
    pub fn with_before<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.before = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the ids this hook runs after.
    #[must_use]
    pub fn with_after<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Adds ids this hook runs before.
    #[must_use]
    pub fn add_before<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.before.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Adds ids this hook runs after.
    #[must_use]
    pub fn add_after<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after.extend(ids.into_iter().map(Into::into));
        self
    }

    pub(crate) fn runs_before(&self, id: &str) -> bool {
        self.before.iter().any(|before| before == id)
    }

    pub(crate) fn runs_after(&self, id: &str) -> bool {
        self.after.iter().any(|after| after == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders() {
        let config = DetourConfig::new("a")
            .with_before(["x", "y"])
            .add_before(["z"])
            .with_after(vec!["w".to_string()])
            .with_sub_priority(3);

        assert_eq!(config.before(), ["x", "y", "z"]);
        assert_eq!(config.after(), ["w"]);
        assert_eq!(config.priority(), None);
        assert_eq!(config.sub_priority(), 3);
        assert!(config.runs_before("y"));
        assert!(config.runs_after("w"));
        assert!(!config.runs_after("x"));

        let config = config.with_priority(5).with_before(Vec::<String>::new());
        assert_eq!(config.priority(), Some(5));
        assert!(config.before().is_empty());
        assert_eq!(config.with_priority(None).priority(), None);
    }
}
