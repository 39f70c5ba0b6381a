//! Owned read/write shared memory mapping of a file descriptor.
//!
//! Used for both sides of a frame: the memfd the X server captures into and
//! the client buffer the frame is copied to.

use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::{self, NonNull};

use nix::errno::Errno;
use nix::sys::mman::{mmap, msync, munmap, MapFlags, MsFlags, ProtFlags};
use tracing::warn;

pub struct MappedRegion {
    ptr: NonNull<c_void>,
    len: usize,
    file: File,
}

// SAFETY: the mapping is exclusively owned by this value and only reachable
// through `&self`/`&mut self`.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// Maps the first `len` bytes of `file` with `MAP_SHARED`.
    ///
    /// Fails if `len` is zero or the file is shorter than `len`, since
    /// touching pages past the end of a file raises SIGBUS.
    pub fn map(file: File, len: usize) -> io::Result<Self> {
        let length = NonZeroUsize::new(len).ok_or(io::Error::from(Errno::EINVAL))?;
        let file_len = file.metadata()?.len();
        if file_len < len as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("file holds {file_len} bytes, {len} requested"),
            ));
        }
        // SAFETY: a fresh mapping at an address chosen by the kernel; nothing
        // else in this process refers to it.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )?
        };
        Ok(Self { ptr, len, file })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// The mapped bytes. Another process may be writing to them.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    /// Reads the little-endian u64 at `offset` with a volatile load, since the
    /// producer may rewrite it at any time.
    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        if offset.checked_add(8)? > self.len {
            return None;
        }
        let mut word = [0u8; 8];
        for (i, byte) in word.iter_mut().enumerate() {
            // SAFETY: offset + i < len was checked above.
            *byte = unsafe { ptr::read_volatile(self.ptr.as_ptr().cast::<u8>().add(offset + i)) };
        }
        Some(u64::from_le_bytes(word))
    }

    /// Copies `data` to the start of the mapping.
    pub fn write_at_start(&mut self, data: &[u8]) -> io::Result<()> {
        if data.len() > self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} bytes do not fit a {}-byte mapping", data.len(), self.len),
            ));
        }
        // SAFETY: bounds checked above; a mapping never overlaps a Rust slice.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().cast::<u8>(), data.len()) };
        Ok(())
    }

    /// Flushes the whole mapping synchronously.
    pub fn sync(&self) -> io::Result<()> {
        // SAFETY: ptr/len describe exactly one live mapping.
        unsafe { msync(self.ptr, self.len, MsFlags::MS_SYNC)? };
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from mmap and are unmapped exactly once.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!("munmap failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};

    fn file_of(len: u64) -> File {
        let file = tempfile::tempfile().unwrap();
        file.set_len(len).unwrap();
        file
    }

    #[test]
    fn test_written_bytes_reach_the_file() {
        // Arrange
        let mut region = MappedRegion::map(file_of(16), 16).unwrap();

        // Act
        region.write_at_start(&[1, 2, 3, 4]).unwrap();
        region.sync().unwrap();

        // Assert
        let mut contents = Vec::new();
        let mut file = region.file().try_clone().unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut contents).unwrap();
        assert_eq!(&contents[..4], &[1, 2, 3, 4]);
        assert_eq!(region.as_slice()[..4], [1, 2, 3, 4]);
    }

    #[test]
    fn test_read_u64_is_little_endian_and_bounded() {
        let mut region = MappedRegion::map(file_of(8), 8).unwrap();
        region.write_at_start(&0x0102_0304_0506_0708u64.to_le_bytes()).unwrap();

        assert_eq!(region.read_u64(0), Some(0x0102_0304_0506_0708));
        assert_eq!(region.read_u64(1), None);
    }

    #[test]
    fn test_mapping_past_end_of_file_is_refused() {
        let result = MappedRegion::map(file_of(4), 4096);

        assert!(matches!(result, Err(e) if e.kind() == io::ErrorKind::InvalidInput));
    }

    #[test]
    fn test_zero_length_is_refused() {
        assert!(MappedRegion::map(file_of(4), 0).is_err());
    }

    #[test]
    fn test_oversized_write_is_refused() {
        let mut region = MappedRegion::map(file_of(4), 4).unwrap();
        assert!(region.write_at_start(&[0; 5]).is_err());
    }
}
