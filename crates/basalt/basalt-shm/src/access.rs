use crate::segment::{Segment, SegmentHandle};
use crate::ShmError;
use basalt_mmap::SharedMapping;
use basalt_msg::SegmentKey;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

struct Attached {
    handle: SegmentHandle,
    attach_count: usize,
}

/// The set of segments this process has attached.
///
/// Attaching is idempotent per key: a second `attach` of an attached key
/// returns a handle to the same mapping and only bumps its attach count.
/// Dropping the access object detaches everything it attached; the backing
/// files stay so other processes keep their view.
pub struct SharedMemoryAccess {
    dir: PathBuf,
    segments: BTreeMap<SegmentKey, Attached>,
    /// First key attached through this object.
    primary: Option<SegmentKey>,
}

/// Backing file for `key` under `dir`.
pub fn segment_path(dir: &Path, key: SegmentKey) -> PathBuf {
    dir.join(format!("basalt-seg-{:08x}", key.0 as u32))
}

/// Remove the backing file of a segment. Only the creator should do this;
/// processes that still have it mapped keep their mapping.
pub fn remove_segment(dir: &Path, key: SegmentKey) -> io::Result<()> {
    std::fs::remove_file(segment_path(dir, key))
}

impl SharedMemoryAccess {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            segments: BTreeMap::new(),
            primary: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Attach segment `key` with at least `size` bytes, creating it if no
    /// process has yet.
    pub fn attach(&mut self, key: SegmentKey, size: usize) -> Result<SegmentHandle, ShmError> {
        if let Some(entry) = self.segments.get_mut(&key) {
            entry.attach_count += 1;
            if size > entry.handle.len() {
                warn!(
                    %key,
                    requested = size,
                    mapped = entry.handle.len(),
                    "segment already attached with a smaller size; keeping existing mapping"
                );
            }
            debug!(%key, count = entry.attach_count, "segment re-attached");
            return Ok(entry.handle.clone());
        }

        let path = segment_path(&self.dir, key);
        let mm = SharedMapping::open_or_create(&path, size as u64).map_err(|e| {
            ShmError::SegmentUnavailable {
                key,
                size,
                reason: format!("{}: {e}", path.display()),
            }
        })?;
        debug!(
            %key,
            len = mm.len(),
            created = mm.created(),
            path = %path.display(),
            "segment attached"
        );

        let handle = SegmentHandle {
            segment: Arc::new(Segment::new(key, mm)),
        };
        self.segments.insert(
            key,
            Attached {
                handle: handle.clone(),
                attach_count: 1,
            },
        );
        self.primary.get_or_insert(key);
        Ok(handle)
    }

    pub fn get(&self, key: SegmentKey) -> Option<SegmentHandle> {
        self.segments.get(&key).map(|a| a.handle.clone())
    }

    /// Base address of an attached segment.
    pub fn pointer(&self, key: SegmentKey) -> Option<*mut u8> {
        self.segments.get(&key).map(|a| a.handle.as_ptr())
    }

    /// The segment this process was assigned first (its working segment).
    pub fn primary(&self) -> Option<SegmentHandle> {
        self.primary.and_then(|key| self.get(key))
    }

    /// Drop one attachment of `key`. Returns true when that was the last one
    /// and the entry was removed.
    pub fn detach(&mut self, key: SegmentKey) -> bool {
        let Some(entry) = self.segments.get_mut(&key) else {
            return false;
        };
        entry.attach_count -= 1;
        if entry.attach_count > 0 {
            return false;
        }
        self.segments.remove(&key);
        if self.primary == Some(key) {
            self.primary = None;
        }
        debug!(%key, "segment detached");
        true
    }

    pub fn detach_all(&mut self) {
        if !self.segments.is_empty() {
            debug!(count = self.segments.len(), "detaching all segments");
        }
        self.segments.clear();
        self.primary = None;
    }

    /// Number of distinct mappings held.
    pub fn mapping_count(&self) -> usize {
        self.segments.len()
    }

    pub fn attach_count(&self, key: SegmentKey) -> usize {
        self.segments.get(&key).map_or(0, |a| a.attach_count)
    }

    pub fn keys(&self) -> impl Iterator<Item = SegmentKey> + '_ {
        self.segments.keys().copied()
    }
}

impl Drop for SharedMemoryAccess {
    fn drop(&mut self) {
        self.detach_all();
    }
}

impl std::fmt::Debug for SharedMemoryAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryAccess")
            .field("dir", &self.dir)
            .field("keys", &self.segments.keys().collect::<Vec<_>>())
            .field("primary", &self.primary)
            .finish()
    }
}
