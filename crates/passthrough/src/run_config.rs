//! Instruction sets returned by lifecycle operations
//!
//! A [`RunConfig`] is built fresh per call and handed to the caller, which
//! applies the mount instructions, forwards the uevents into the instance, and
//! only then runs the post-hooks.

use crate::error::Result;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// One mount-level action for the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum MountInstruction {
    /// Create `host_path` as a character device and expose it at `target_path`
    CharDevice {
        host_path: PathBuf,
        /// Relative to the instance root
        target_path: PathBuf,
        major: u32,
        minor: u32,
        mode: u32,
        uid: u32,
        gid: u32,
        /// Keep the node across instance restarts
        persistent: bool,
    },
    /// Unmount `target_path` from the instance
    Unmount {
        host_path: PathBuf,
        target_path: PathBuf,
    },
}

/// Deferred action run after the mount instructions were applied
pub type PostHook = Box<dyn FnOnce() -> Result<()> + Send>;

/// Accumulated instructions from one lifecycle call
#[derive(Default, Serialize)]
pub struct RunConfig {
    pub mounts: Vec<MountInstruction>,
    /// Raw uevents forwarded unchanged into the instance
    pub uevents: Vec<Vec<String>>,
    #[serde(skip)]
    pub post_hooks: Vec<PostHook>,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty() && self.uevents.is_empty() && self.post_hooks.is_empty()
    }

    /// Queue a deferred action
    pub fn add_post_hook<F>(&mut self, hook: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.post_hooks.push(Box::new(hook));
    }

    /// Run queued post-hooks in order
    ///
    /// Hooks are drained; the first failure stops the run and is returned.
    pub fn run_post_hooks(&mut self) -> Result<()> {
        for hook in self.post_hooks.drain(..) {
            hook()?;
        }
        Ok(())
    }
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("mounts", &self.mounts)
            .field("uevents", &self.uevents)
            .field("post_hooks", &self.post_hooks.len())
            .finish()
    }
}
