use std::fmt;

use serde::{Deserialize, Serialize};

/// Name, size and media type of one file in a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub mime: String,
}

/// Which end of a transfer an outcome is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Sender,
    Receiver,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender => f.write_str("sender"),
            Self::Receiver => f.write_str("receiver"),
        }
    }
}

/// Byte progress of a whole session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub processed_bytes: u64,
    pub total_bytes: u64,
    pub percent: f64,
}

impl Progress {
    pub fn new(processed_bytes: u64, total_bytes: u64) -> Self {
        let percent = if total_bytes == 0 {
            100.0
        } else {
            (processed_bytes as f64 / total_bytes as f64 * 100.0).min(100.0)
        };
        Self {
            processed_bytes,
            total_bytes,
            percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_clamped_and_empty_is_done() {
        assert_eq!(Progress::new(50, 200).percent, 25.0);
        assert_eq!(Progress::new(300, 200).percent, 100.0);
        assert_eq!(Progress::new(0, 0).percent, 100.0);
    }
}
