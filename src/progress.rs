//! Progress display for client transfers.

use indicatif::{ProgressBar, ProgressStyle};

/// Chunk-granular progress bar for one file transfer.
pub struct TransferProgress {
    bar: Option<ProgressBar>,
}

impl TransferProgress {
    /// Create a tracker over `total_chunks`. With `show` false this is a
    /// no-op shell, so callers never need to branch.
    pub fn new(total_chunks: u64, show: bool) -> Self {
        let bar = if show {
            let pb = ProgressBar::new(total_chunks);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg:18.18} {pos:>8}/{len:<8} chunks {percent:>3}% {per_sec:>14} {eta:>8}")
                    .unwrap()
                    .progress_chars("█▉▊▋▌▍▎▏ "),
            );
            Some(pb)
        } else {
            None
        };
        Self { bar }
    }

    pub fn set_message(&self, msg: String) {
        if let Some(ref pb) = self.bar {
            pb.set_message(msg);
        }
    }

    /// Move the bar to `received_chunks`. Also used to rewind after the
    /// server re-issued the fileID and the transfer restarted.
    pub fn set_position(&self, received_chunks: u64) {
        if let Some(ref pb) = self.bar {
            pb.set_position(received_chunks);
        }
    }

    pub fn finish(&self) {
        if let Some(ref pb) = self.bar {
            pb.finish_and_clear();
        }
    }
}
