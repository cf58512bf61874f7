//! On-disk media segments and the sliding window over them.
//!
//! A fragment is written to `<final>.tmp` and renamed to its final path on
//! commit, substituting any `[duration]` token with the measured integer
//! milliseconds. The window keeps the active list bounded by total
//! duration; shrunk fragments move to an expired list whose files survive
//! until `clear_expired` runs, giving in-flight players a grace period.

use std::path::{Path, PathBuf};

use crate::error::{ServerError, ServerResult};

/// The largest DTS accepted before resetting to zero, in ms.
const MAX_DTS_MS: i64 = 0x7fff_ffff_ffff_ffff / 1000;

/// One segment on disk.
pub struct Fragment {
    path: PathBuf,
    start_dts_ms: Option<i64>,
    duration_ms: i64,
    sequence_header: bool,
    number: u64,
}

impl Fragment {
    /// Creates a fragment with no path or samples yet.
    pub fn new() -> Self {
        Self {
            path: PathBuf::new(),
            start_dts_ms: None,
            duration_ms: 0,
            sequence_header: false,
            number: 0,
        }
    }

    /// Accounts one sample's DTS into the duration.
    ///
    /// Negative or overflowed DTS are reset to zero. The start shifts
    /// backward on out-of-order DTS, so the duration is the observed span.
    pub fn append(&mut self, dts_ms: i64) {
        let dts_ms = if !(0..=MAX_DTS_MS).contains(&dts_ms) {
            0
        } else {
            dts_ms
        };

        let start = match self.start_dts_ms {
            None => dts_ms,
            Some(start) => start.min(dts_ms),
        };
        self.start_dts_ms = Some(start);
        self.duration_ms = dts_ms - start;
    }

    /// The observed duration in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    /// The first (smallest) DTS observed.
    pub fn start_dts_ms(&self) -> Option<i64> {
        self.start_dts_ms
    }

    /// Whether the segment carries a sequence header.
    pub fn is_sequence_header(&self) -> bool {
        self.sequence_header
    }

    pub fn set_sequence_header(&mut self, v: bool) {
        self.sequence_header = v;
    }

    /// The final path (template until renamed).
    pub fn fullpath(&self) -> &Path {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    /// The temp path written before commit.
    pub fn tmppath(&self) -> PathBuf {
        let mut p = self.path.as_os_str().to_owned();
        p.push(".tmp");
        PathBuf::from(p)
    }

    /// Monotonic segment number.
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn set_number(&mut self, n: u64) {
        self.number = n;
    }

    /// Creates the directory the segment lives in.
    pub fn create_dir(&self) -> ServerResult<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| ServerError::Io(e).wrap(format!("create {}", dir.display())))?;
        }
        Ok(())
    }

    /// Commits the segment: substitutes `[duration]` in the path template
    /// and atomically renames the temp file onto it.
    pub fn rename(&mut self) -> ServerResult<()> {
        let tmp = self.tmppath();
        let full = self
            .path
            .to_string_lossy()
            .replace("[duration]", &self.duration_ms.to_string());
        let full = PathBuf::from(full);

        std::fs::rename(&tmp, &full).map_err(|e| {
            ServerError::Io(e).wrap(format!(
                "rename {} to {}",
                tmp.display(),
                full.display()
            ))
        })?;
        self.path = full;
        Ok(())
    }

    /// Deletes the committed file.
    pub fn unlink_file(&self) -> ServerResult<()> {
        std::fs::remove_file(&self.path)
            .map_err(|e| ServerError::Io(e).wrap(format!("unlink {}", self.path.display())))
    }

    /// Deletes the temp file.
    pub fn unlink_tmpfile(&self) -> ServerResult<()> {
        let tmp = self.tmppath();
        std::fs::remove_file(&tmp)
            .map_err(|e| ServerError::Io(e).wrap(format!("unlink tmp {}", tmp.display())))
    }
}

impl Default for Fragment {
    fn default() -> Self {
        Self::new()
    }
}

/// The sliding window of segments: active, then expired, then gone.
#[derive(Default)]
pub struct FragmentWindow {
    fragments: Vec<Fragment>,
    expired: Vec<Fragment>,
}

impl FragmentWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a committed fragment to the active list.
    pub fn append(&mut self, fragment: Fragment) {
        self.fragments.push(fragment);
    }

    /// Moves fragments beyond the window to the expired list.
    ///
    /// Walks newest to oldest accumulating durations; once the sum exceeds
    /// the window, everything older is expired (files still on disk).
    pub fn shrink(&mut self, window_ms: i64) {
        let mut duration = 0i64;
        let mut remove_index: Option<usize> = None;

        for (i, fragment) in self.fragments.iter().enumerate().rev() {
            duration += fragment.duration_ms();
            if duration > window_ms {
                remove_index = Some(i);
                break;
            }
        }

        if let Some(idx) = remove_index {
            // The fragment that crossed the window is expired with the rest:
            // the active list stays within the configured duration.
            let expired: Vec<Fragment> = self.fragments.drain(..=idx).collect();
            self.expired.extend(expired);
        }
    }

    /// Deletes expired fragments, unlinking their files when asked.
    pub fn clear_expired(&mut self, delete_files: bool) {
        for fragment in self.expired.drain(..) {
            if delete_files {
                if let Err(err) = fragment.unlink_file() {
                    log::warn!("[Fragment] unlink failed: {}", err);
                }
            }
        }
    }

    /// Deletes everything, including files of active fragments.
    pub fn dispose(&mut self) {
        for fragment in self.fragments.drain(..).chain(self.expired.drain(..)) {
            if let Err(err) = fragment.unlink_file() {
                log::warn!("[Fragment] unlink failed: {}", err);
            }
        }
    }

    /// The longest active duration (drives EXT-X-TARGETDURATION).
    pub fn max_duration_ms(&self) -> i64 {
        self.fragments
            .iter()
            .map(Fragment::duration_ms)
            .max()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn size(&self) -> usize {
        self.fragments.len()
    }

    pub fn expired_size(&self) -> usize {
        self.expired.len()
    }

    pub fn first(&self) -> Option<&Fragment> {
        self.fragments.first()
    }

    pub fn at(&self, index: usize) -> Option<&Fragment> {
        self.fragments.get(index)
    }

    /// Iterates the active fragments oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.iter()
    }
}
