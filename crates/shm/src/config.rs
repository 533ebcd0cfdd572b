//! Run-time sizing for a [`Kernel`](crate::Kernel).

/// Sizes of the fixed tables a kernel is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of physical frames in the pool.
    pub frames: usize,
    /// Number of process slots.
    pub max_processes: usize,
    /// Number of mapping registry slots.
    pub max_mappings: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            frames: 2048,
            max_processes: 64,
            max_mappings: 128,
        }
    }
}

impl KernelConfig {
    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    pub fn with_max_processes(mut self, max_processes: usize) -> Self {
        self.max_processes = max_processes;
        self
    }

    pub fn with_max_mappings(mut self, max_mappings: usize) -> Self {
        self.max_mappings = max_mappings;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_override_defaults() {
        let config = KernelConfig::default().with_frames(64).with_max_mappings(2);
        assert_eq!(config.frames, 64);
        assert_eq!(config.max_processes, 64);
        assert_eq!(config.max_mappings, 2);
    }
}
