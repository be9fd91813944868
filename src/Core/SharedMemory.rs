// Shared memory backend abstraction for Linux
// Uses named files under /dev/shm + mmap so unrelated processes can meet on a region

use std::fmt::Debug;
use std::io;
#[cfg(target_os = "linux")]
use std::ptr::NonNull;

/// Directory that backs named shared memory regions.
pub const SHM_DIR: &str = "/dev/shm";

/// Shared memory backend trait for cross-platform memory mapping
pub trait SharedMemoryBackend: Send + Sync + Debug {
    /// Get a pointer to the mapped memory region
    fn as_ptr(&self) -> *mut u8;

    /// Get the size of the mapped region in bytes
    fn size(&self) -> usize;

    /// Get the underlying file descriptor
    fn raw_handle(&self) -> RawHandle;

    /// Name of the region under `/dev/shm`
    fn name(&self) -> &str;
}

/// Platform-specific handle type
#[derive(Debug, Clone, Copy)]
pub enum RawHandle {
    /// Unix file descriptor (Linux)
    Fd(i32),
}

/// Path of a named region.
pub fn region_path(name: &str) -> String {
    format!("{}/{}", SHM_DIR, name)
}

fn validate_name(name: &str) -> io::Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid shared memory region name {:?}", name),
        ));
    }
    Ok(())
}

/// Create a named shared memory region of `size` bytes.
///
/// Fails with `AlreadyExists` when the name is taken; a live region is never truncated.
///
/// # Arguments
/// * `size` - Size of the shared memory region in bytes
/// * `name` - Name of the region below `/dev/shm`
#[cfg(target_os = "linux")]
pub fn create_shared_memory(size: usize, name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::create(size, name)?))
}

/// Attach to an existing named shared memory region.
///
/// The region must be at least `min_size` bytes; the whole file is mapped.
#[cfg(target_os = "linux")]
pub fn attach_shared_memory(name: &str, min_size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::attach(name, min_size)?))
}

/// Remove a named region. Existing mappings stay valid until they are dropped.
pub fn unlink_shared_memory(name: &str) -> io::Result<()> {
    validate_name(name)?;
    match std::fs::remove_file(region_path(name)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove the name only while it still refers to the region mapped by `shm`.
///
/// A region reclaimed by a newer creator keeps its name.
#[cfg(target_os = "linux")]
pub fn unlink_if_current(shm: &dyn SharedMemoryBackend) -> io::Result<()> {
    use std::os::unix::fs::MetadataExt;

    let RawHandle::Fd(fd) = shm.raw_handle();
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    match std::fs::metadata(region_path(shm.name())) {
        Ok(meta) if meta.ino() == st.st_ino as u64 && meta.dev() == st.st_dev as u64 => {
            unlink_shared_memory(shm.name())
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn unlink_if_current(shm: &dyn SharedMemoryBackend) -> io::Result<()> {
    unlink_shared_memory(shm.name())
}

#[cfg(not(target_os = "linux"))]
pub fn create_shared_memory(_size: usize, _name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn attach_shared_memory(_name: &str, _min_size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct LinuxSharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    fd: i32,
    name: String,
}

#[cfg(target_os = "linux")]
unsafe impl Send for LinuxSharedMemory {}
#[cfg(target_os = "linux")]
unsafe impl Sync for LinuxSharedMemory {}

#[cfg(target_os = "linux")]
impl LinuxSharedMemory {
    /// Create a new shared memory region using /dev/shm
    pub fn create(size: usize, name: &str) -> io::Result<Self> {
        use std::fs::OpenOptions;
        use std::os::fd::{AsRawFd, IntoRawFd};
        use std::os::unix::fs::OpenOptionsExt;

        validate_name(name)?;
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared memory region size must be non-zero",
            ));
        }
        let path = region_path(name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("Failed to create shared memory file at {}: {}", path, e),
                )
            })?;

        if unsafe { libc::ftruncate(file.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }

        // Keep the file descriptor alive for the lifetime of the mapping
        let fd = file.into_raw_fd();
        let ptr = unsafe { map_fd(fd, size) }?;

        Ok(Self {
            ptr,
            size,
            fd,
            name: name.to_string(),
        })
    }

    /// Attach to an existing region created by another process (or thread)
    pub fn attach(name: &str, min_size: usize) -> io::Result<Self> {
        use std::fs::OpenOptions;
        use std::os::fd::IntoRawFd;

        validate_name(name)?;
        let path = region_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("Failed to open shared memory at {}: {}", path, e),
                )
            })?;

        let size = file.metadata()?.len() as usize;
        if size == 0 || size < min_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Shared memory size too small: expected at least {} bytes, got {}",
                    min_size, size
                ),
            ));
        }

        let fd = file.into_raw_fd();
        let ptr = unsafe { map_fd(fd, size) }?;

        Ok(Self {
            ptr,
            size,
            fd,
            name: name.to_string(),
        })
    }
}

/// mmap the whole file shared and read/write. Closes `fd` on failure.
///
/// # Safety
/// `fd` must be an open descriptor for a file of at least `size` bytes.
#[cfg(target_os = "linux")]
unsafe fn map_fd(fd: i32, size: usize) -> io::Result<NonNull<u8>> {
    let ptr = libc::mmap(
        std::ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        fd,
        0,
    );
    if ptr == libc::MAP_FAILED {
        let err = io::Error::last_os_error();
        libc::close(fd);
        return Err(err);
    }
    // mmap hands back page-aligned memory, which covers the 128-byte header alignment
    match NonNull::new(ptr as *mut u8) {
        Some(p) => Ok(p),
        None => {
            libc::close(fd);
            Err(io::Error::new(io::ErrorKind::Other, "mmap returned null"))
        }
    }
}

#[cfg(target_os = "linux")]
impl Drop for LinuxSharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
    }
}

#[cfg(target_os = "linux")]
impl SharedMemoryBackend for LinuxSharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn raw_handle(&self) -> RawHandle {
        RawHandle::Fd(self.fd)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
