//! Builder-style configuration for opening a [`super::WriteAheadLog`].

/// Tuning knobs for a [`super::WriteAheadLog`].
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Trigger a checkpoint once the log's aggregate unapplied bytes
    /// exceed this many bytes. `cleanup(false)` only checkpoints when this
    /// (or the no-live-writers condition) holds; `cleanup(true)` always
    /// checkpoints.
    pub checkpoint_threshold_bytes: u64,
    /// If `true`, `Transaction::commit` calls `cleanup(false)` right after
    /// recording the commit, opportunistically checkpointing when the
    /// threshold is crossed. If `false`, checkpointing is entirely up to
    /// the caller.
    pub checkpoint_on_commit: bool,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            checkpoint_threshold_bytes: 4 * 1024 * 1024,
            checkpoint_on_commit: false,
        }
    }
}

impl WalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint_threshold_bytes(mut self, bytes: u64) -> Self {
        self.checkpoint_threshold_bytes = bytes;
        self
    }

    pub fn checkpoint_on_commit(mut self, enabled: bool) -> Self {
        self.checkpoint_on_commit = enabled;
        self
    }
}

/// Tuning knobs for opening a storage backend (test-only parameterization
/// of what is otherwise a fixed-at-compile-time page size).
#[derive(Debug, Clone, Copy)]
pub struct StorageOptions {
    /// Initial size, in bytes, to preallocate on creation.
    pub initial_size: u64,
    /// Maximum bytes per segment file for split storage.
    pub max_segment_size: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            initial_size: 0,
            max_segment_size: 64 * 1024 * 1024,
        }
    }
}

impl StorageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial_size(mut self, bytes: u64) -> Self {
        self.initial_size = bytes;
        self
    }

    pub fn max_segment_size(mut self, bytes: u64) -> Self {
        self.max_segment_size = bytes;
        self
    }
}
