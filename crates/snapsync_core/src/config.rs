//! Database configuration.

/// Options for opening a [`crate::Database`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Create the database directory if it does not exist.
    pub create_if_missing: bool,

    /// Fail if the directory already holds a database.
    pub error_if_exists: bool,

    /// Flush the log after every append. Turning this off trades the
    /// durability of the last few entries for write throughput.
    pub sync_on_append: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            sync_on_append: true,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create a missing database.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether an existing database is an error.
    #[must_use]
    pub const fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets whether to flush after every append.
    #[must_use]
    pub const fn sync_on_append(mut self, value: bool) -> Self {
        self.sync_on_append = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(!config.error_if_exists);
        assert!(config.sync_on_append);
    }

    #[test]
    fn builder_chain() {
        let config = Config::new()
            .create_if_missing(false)
            .error_if_exists(true)
            .sync_on_append(false);
        assert!(!config.create_if_missing);
        assert!(config.error_if_exists);
        assert!(!config.sync_on_append);
    }
}
