//! Platform-specific raw disk I/O
//!
//! Backs a member with a block device or image file:
//! - Linux: optional O_DIRECT, with aligned bounce buffers
//! - macOS: optional F_NOCACHE fcntl

use crate::device::{MemberDevice, check_bounds};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use volset_common::{Error, Result};

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Alignment requirement for direct I/O (typically 4KB or 512 bytes)
pub const ALIGNMENT: usize = 4096;

/// Raw file handle backing a member
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    read_only: bool,
    direct: bool,
}

impl RawFile {
    /// Open an existing device or image through the page cache
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        Self::open_with(path, read_only, false)
    }

    /// Open an existing device or image bypassing the page cache
    pub fn open_direct(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        Self::open_with(path, read_only, true)
    }

    fn open_with(path: impl AsRef<Path>, read_only: bool, direct: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true);
        }

        #[cfg(target_os = "linux")]
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options
            .open(&path)
            .map_err(|e| Error::io(&path_str, format!("failed to open: {e}")))?;

        #[cfg(target_os = "macos")]
        if direct {
            Self::set_nocache(&file, &path_str)?;
        }

        let size = if Self::is_block_device(&path) {
            Self::get_block_device_size(&file, &path_str)?
        } else {
            file.metadata()
                .map_err(|e| Error::io(&path_str, format!("failed to get metadata: {e}")))?
                .len()
        };

        Ok(Self {
            file,
            path: path_str,
            size,
            read_only,
            direct,
        })
    }

    /// Create an image file of the given size.
    ///
    /// Block devices are opened as they are and keep their own size.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let is_block_device = Self::is_block_device(&path);

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !is_block_device {
            options.create(true).truncate(true);
        }

        let file = options
            .open(&path)
            .map_err(|e| Error::io(&path_str, format!("failed to create: {e}")))?;

        let actual_size = if is_block_device {
            Self::get_block_device_size(&file, &path_str)?
        } else {
            file.set_len(size)
                .map_err(|e| Error::io(&path_str, format!("failed to set size: {e}")))?;
            size
        };

        Ok(Self {
            file,
            path: path_str,
            size: actual_size,
            read_only: false,
            direct: false,
        })
    }

    /// Check if path is a block device
    fn is_block_device(path: impl AsRef<Path>) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(&path).is_ok_and(|m| m.file_type().is_block_device())
    }

    #[cfg(target_os = "macos")]
    #[allow(unsafe_code)]
    fn set_nocache(file: &File, path: &str) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fcntl on a descriptor we own
        let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
        if ret == -1 {
            return Err(Error::io(
                path,
                format!("failed to set F_NOCACHE: {}", std::io::Error::last_os_error()),
            ));
        }
        Ok(())
    }

    /// Get block device size using ioctl
    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        // BLKGETSIZE64 ioctl
        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        // SAFETY: BLKGETSIZE64 writes one u64 through the pointer
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if ret == -1 {
            return Err(Error::io(
                path,
                format!(
                    "failed to get block device size: {}",
                    std::io::Error::last_os_error()
                ),
            ));
        }
        Ok(size)
    }

    /// Get block device size (non-Linux fallback)
    #[cfg(not(target_os = "linux"))]
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::io::{Seek, SeekFrom};
        let mut f = file;
        let size = f
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::io(path, format!("failed to get device size: {e}")))?;
        Ok(size)
    }

    /// Get the file path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Span of aligned blocks covering a request
    const fn aligned_span(offset: u64, len: usize) -> (u64, usize) {
        let align = ALIGNMENT as u64;
        let start = offset / align * align;
        let end = (offset + len as u64).div_ceil(align) * align;
        (start, (end - start) as usize)
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::io(&self.path, format!("read at {offset} failed: {e}")))
    }

    fn pwrite(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file
            .write_all_at(data, offset)
            .map_err(|e| Error::io(&self.path, format!("write at {offset} failed: {e}")))
    }
}

impl MemberDevice for RawFile {
    fn name(&self) -> &str {
        &self.path
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(self, offset, buf.len())?;
        if !self.direct {
            return self.pread(offset, buf);
        }

        let (start, span) = Self::aligned_span(offset, buf.len());
        let mut bounce = AlignedBuffer::new(span);
        self.pread(start, bounce.as_mut_slice())?;
        let skip = (offset - start) as usize;
        buf.copy_from_slice(&bounce.as_slice()[skip..skip + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::io(&self.path, "device is read-only"));
        }
        check_bounds(self, offset, data.len())?;
        if !self.direct {
            return self.pwrite(offset, data);
        }

        let (start, span) = Self::aligned_span(offset, data.len());
        let mut bounce = AlignedBuffer::new(span);
        let skip = (offset - start) as usize;
        if skip != 0 || span != data.len() {
            self.pread(start, bounce.as_mut_slice())?;
        }
        bounce.as_mut_slice()[skip..skip + data.len()].copy_from_slice(data);
        self.pwrite(start, bounce.as_slice())
    }

    fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::io(&self.path, format!("sync failed: {e}")))
    }
}

/// Aligned buffer for direct I/O operations
///
/// On Linux with O_DIRECT, the buffer must be aligned to the filesystem's
/// block size (typically 512 or 4096 bytes).
pub struct AlignedBuffer {
    ptr: std::ptr::NonNull<u8>,
    len: usize,
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    alignment: usize,
}

// SAFETY: the buffer exclusively owns its allocation
#[allow(unsafe_code)]
unsafe impl Send for AlignedBuffer {}

#[allow(unsafe_code)]
impl AlignedBuffer {
    /// Create a zeroed buffer of at least `size` bytes, rounded up to ALIGNMENT
    #[must_use]
    pub fn new(size: usize) -> Self {
        let alignment = ALIGNMENT;
        let len = size.div_ceil(alignment).max(1) * alignment;
        let layout = Self::layout(len, alignment);
        // SAFETY: layout has non-zero size
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(ptr) = std::ptr::NonNull::new(raw) else {
            std::alloc::handle_alloc_error(layout);
        };
        Self {
            ptr,
            len,
            alignment,
        }
    }

    fn layout(len: usize, alignment: usize) -> std::alloc::Layout {
        match std::alloc::Layout::from_size_align(len, alignment) {
            Ok(layout) => layout,
            Err(_) => std::alloc::Layout::new::<u8>(),
        }
    }

    /// Get the buffer as a slice
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialized bytes
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Get the buffer as a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and uniquely borrowed
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Get the buffer size
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if buffer is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[allow(unsafe_code)]
impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        let layout = Self::layout(self.len, self.alignment);
        // SAFETY: allocated in `new` with this layout
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::new(100);
        assert_eq!(buf.len(), 4096);
        assert_eq!(buf.as_slice().as_ptr() as usize % ALIGNMENT, 0);
        buf.as_mut_slice()[..5].copy_from_slice(b"hello");
        assert_eq!(&buf.as_slice()[..5], b"hello");
    }

    #[test]
    fn test_aligned_span() {
        assert_eq!(RawFile::aligned_span(0, 4096), (0, 4096));
        assert_eq!(RawFile::aligned_span(100, 10), (0, 4096));
        assert_eq!(RawFile::aligned_span(4000, 200), (0, 8192));
    }

    #[test]
    fn test_raw_file_create_and_read() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path();

        {
            let file = RawFile::create(path, 64 * 1024).unwrap();
            assert_eq!(file.size(), 64 * 1024);
            file.write_at(4000, b"test data pattern").unwrap();
            file.sync().unwrap();
        }

        {
            let file = RawFile::open(path, true).unwrap();
            assert_eq!(file.read_bytes(4000, 17).unwrap(), b"test data pattern");
            assert!(file.write_at(0, b"x").is_err());
            assert!(file.read_bytes(64 * 1024 - 4, 8).is_err());
        }
    }
}
