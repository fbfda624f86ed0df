//! Rotation policy
//!
//! Decides whether a buffer file has to be closed and handed to the upload
//! pool. A policy is built once from validated configuration and only ever
//! looks at a [`FileStat`] snapshot, so checking it has no side effects.

use crate::config::{ConfigError, RotationConfig, RotationStrategy};
use std::fmt;
use std::time::{Duration, SystemTime};

/// Point-in-time view of a buffer file's metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub created_at: SystemTime,
}

impl FileStat {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Age of the file at `now`; zero if the clock went backwards
    pub fn age_at(&self, now: SystemTime) -> Duration {
        now.duration_since(self.created_at).unwrap_or(Duration::ZERO)
    }
}

/// When to rotate a buffer file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPolicy {
    /// Rotate once the file reaches `size_file` bytes
    Size { size_file: u64 },
    /// Rotate a non-empty file once it is `time_file` old
    Time { time_file: Duration },
    /// Whichever of the two fires first
    SizeAndTime { size_file: u64, time_file: Duration },
}

impl RotationPolicy {
    pub fn size(size_file: u64) -> Result<Self, ConfigError> {
        positive_size("size", size_file)?;
        Ok(Self::Size { size_file })
    }

    pub fn time(time_file: Duration) -> Result<Self, ConfigError> {
        positive_time("time", time_file)?;
        Ok(Self::Time { time_file })
    }

    pub fn size_and_time(size_file: u64, time_file: Duration) -> Result<Self, ConfigError> {
        positive_size("size_and_time", size_file)?;
        positive_time("size_and_time", time_file)?;
        Ok(Self::SizeAndTime {
            size_file,
            time_file,
        })
    }

    /// Build the policy selected by `rotation.strategy`
    pub fn from_config(config: &RotationConfig) -> Result<Self, ConfigError> {
        let time_file = Duration::from_secs(config.time_file);
        match config.strategy {
            RotationStrategy::Size => Self::size(config.size_file),
            RotationStrategy::Time => Self::time(time_file),
            RotationStrategy::SizeAndTime => Self::size_and_time(config.size_file, time_file),
        }
    }

    /// Evaluate the policy against `stat` as of `now`
    pub fn rotate_at(&self, stat: &FileStat, now: SystemTime) -> bool {
        match *self {
            Self::Size { size_file } => stat.size >= size_file,
            Self::Time { time_file } => aged_out(stat, now, time_file),
            Self::SizeAndTime {
                size_file,
                time_file,
            } => stat.size >= size_file || aged_out(stat, now, time_file),
        }
    }

    pub fn should_rotate(&self, stat: &FileStat) -> bool {
        self.rotate_at(stat, SystemTime::now())
    }

    /// Whether idle partitions need a timer to be rotated.
    ///
    /// A size-only policy can only flip after a write, and every write batch
    /// already runs a rotation check.
    pub fn needs_periodic(&self) -> bool {
        !matches!(self, Self::Size { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Size { .. } => "size",
            Self::Time { .. } => "time",
            Self::SizeAndTime { .. } => "size_and_time",
        }
    }
}

impl fmt::Display for RotationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn aged_out(stat: &FileStat, now: SystemTime, time_file: Duration) -> bool {
    !stat.is_empty() && stat.age_at(now) >= time_file
}

fn positive_size(policy: &str, size_file: u64) -> Result<(), ConfigError> {
    if size_file == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{} policy needs a positive size_file",
            policy
        )));
    }
    Ok(())
}

fn positive_time(policy: &str, time_file: Duration) -> Result<(), ConfigError> {
    if time_file.is_zero() {
        return Err(ConfigError::ValidationError(format!(
            "{} policy needs a positive time_file",
            policy
        )));
    }
    Ok(())
}
