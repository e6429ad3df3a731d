use memmap2::MmapMut;
use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

/// A file mapped read-write with shared semantics, so every process mapping
/// the same path sees the same bytes.
pub struct SharedMapping {
    _file: File,
    mmap: MmapMut,
    created: bool,
}

impl SharedMapping {
    /// Map the file at `path`, creating it with `min_len` zeroed bytes if it
    /// does not exist yet.
    ///
    /// An existing file is joined as-is and never truncated. If it is shorter
    /// than `min_len` the call fails with `InvalidData`: somebody else owns that
    /// name with an incompatible size.
    pub fn open_or_create<P: AsRef<Path>>(path: P, min_len: u64) -> io::Result<Self> {
        let path = path.as_ref();
        if min_len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping length must be > 0",
            ));
        }

        // create_new makes creation race-free between processes; losing the
        // race just means joining the winner's file.
        let (file, created) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => {
                file.set_len(min_len)?;
                (file, true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                (OpenOptions::new().read(true).write(true).open(path)?, false)
            }
            Err(e) => return Err(e),
        };

        let existing = file.metadata()?.len();
        if existing < min_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("existing file is {existing} bytes, {min_len} requested"),
            ));
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            _file: file,
            mmap,
            created,
        })
    }

    /// Return raw pointer to start of memory mapped file data
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Whether this mapping created the backing file.
    pub fn created(&self) -> bool {
        self.created
    }
}
