//! Engine configuration.
//!
//! One plain struct, populated before a run starts and read-only afterwards.
//! Option names follow the CLI flags one to one.

/// How deletions on the destination are scheduled relative to copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Never delete.
    Off,
    /// Delete destination-only files before any copy starts.
    Before,
    /// Stream deletions concurrently with copies.
    During,
    /// Accumulate deletions and apply them only after all copies succeed.
    After,
    /// Delete only, copy nothing.
    Only,
}

impl std::str::FromStr for DeleteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(DeleteMode::Off),
            "before" => Ok(DeleteMode::Before),
            "during" => Ok(DeleteMode::During),
            "after" => Ok(DeleteMode::After),
            "only" => Ok(DeleteMode::Only),
            other => Err(format!(
                "invalid delete mode {:?}, expected off/before/during/after/only",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Number of checker workers (and rename workers when enabled).
    pub checkers: usize,
    /// Number of transfer workers; also sizes the pipeline channels.
    pub transfers: usize,
    /// Attempts for a single object transfer before giving up.
    pub low_level_retries: u32,
    /// Override the computed modification time comparison window.
    pub modify_window: Option<std::time::Duration>,
    /// Skip listing the destination; look each path up individually.
    pub no_traverse: bool,
    /// Use the flat list-then-match traversal instead of
    /// directory-at-a-time.
    pub flat: bool,
    pub ignore_existing: bool,
    pub ignore_times: bool,
    pub update_older: bool,
    pub size_only: bool,
    pub track_renames: bool,
    pub delete_mode: DeleteMode,
    /// Remote spec overwrites and deletes are rerouted into.
    pub backup_dir: Option<String>,
    /// Suffix appended to names placed in the backup dir.
    pub suffix: String,
    /// Suppress all write-side effects; still traverse and log.
    pub dry_run: bool,
    /// Recursion ceiling on the source; `None` means unlimited.
    pub max_depth: Option<u32>,
    /// Let destination deletion recurse past `max_depth`.
    pub delete_excluded: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            checkers: 8,
            transfers: 4,
            low_level_retries: 10,
            modify_window: None,
            no_traverse: false,
            flat: false,
            ignore_existing: false,
            ignore_times: false,
            update_older: false,
            size_only: false,
            track_renames: false,
            delete_mode: DeleteMode::After,
            backup_dir: None,
            suffix: String::new(),
            dry_run: false,
            max_depth: None,
            delete_excluded: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_mode_parsing() {
        assert_eq!("during".parse::<DeleteMode>().unwrap(), DeleteMode::During);
        assert_eq!("off".parse::<DeleteMode>().unwrap(), DeleteMode::Off);
        assert!("sometimes".parse::<DeleteMode>().is_err());
    }
}
