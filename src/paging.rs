//! Secondary-storage backend for cold segments.
//!
//! The core decides *which* segment to evict and *when* (see
//! `SegmentTable::evict_cold`); how bytes reach storage is delegated to a
//! [`Pager`] the host injects, with [`FilePager`] as the default.

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

/// Host-injectable paging backend.
///
/// `page_out`/`page_in` must round-trip a segment byte-for-byte within one
/// session; content need not survive a process restart.
pub trait Pager {
    /// Bytes of physical memory still available to the runtime.
    fn available_memory(&self) -> usize;

    /// Persist a segment's content.
    fn page_out(&mut self, segment_id: u32, data: &[u8]) -> io::Result<()>;

    /// Load a previously paged-out segment into `buf`, which is exactly
    /// one segment long.
    fn page_in(&mut self, segment_id: u32, buf: &mut [u8]) -> io::Result<()>;

    /// Drop any persisted image for a segment. Best-effort.
    fn discard(&mut self, segment_id: u32);
}

/// Default pager: one file per segment under a configured directory.
///
/// File names combine a per-session tag with the segment index, so two
/// live runtimes sharing a directory cannot clobber each other's pages.
pub struct FilePager {
    dir: PathBuf,
    session: String,
}

impl FilePager {
    pub fn new(dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(FilePager {
            dir,
            session: session_tag(),
        })
    }

    fn page_path(&self, segment_id: u32) -> PathBuf {
        self.dir.join(format!("{}-{}.bin", self.session, segment_id))
    }
}

/// Four-digit tag, unique enough across concurrent sessions. Derived from
/// the clock and pid; the naming scheme only has to hold for one session.
fn session_tag() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{:04}", (nanos ^ std::process::id()) % 10_000)
}

impl Pager for FilePager {
    fn available_memory(&self) -> usize {
        // The default backend has no portable view of the heap; report
        // "plenty" so eviction only triggers when the host wires up a real
        // figure. Embedded hosts supply their own pager.
        usize::MAX
    }

    fn page_out(&mut self, segment_id: u32, data: &[u8]) -> io::Result<()> {
        let path = self.page_path(segment_id);
        debug!("paging out segment {segment_id} to {}", path.display());
        let mut file = fs::File::create(&path)?;
        file.write_all(data)?;
        file.sync_data()
    }

    fn page_in(&mut self, segment_id: u32, buf: &mut [u8]) -> io::Result<()> {
        let path = self.page_path(segment_id);
        debug!("paging in segment {segment_id} from {}", path.display());
        let mut file = fs::File::open(&path)?;
        file.read_exact(buf)
    }

    fn discard(&mut self, segment_id: u32) {
        let path = self.page_path(segment_id);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("could not remove page file {}: {err}", path.display());
            }
        }
    }
}

impl Drop for FilePager {
    fn drop(&mut self) {
        // Page files are session-scoped; sweep what this session created.
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        let prefix = format!("{}-", self.session);
        for entry in entries.flatten() {
            if entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(&prefix))
            {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}
