// Backing memory for rings and stacks.
// Heap regions for process-local objects, /dev/shm mappings for objects that a
// second process attaches to by name.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt::Debug;
use std::io;
use std::ptr::NonNull;

/// Shared memory backend trait for cross-platform memory mapping
pub trait SharedMemoryBackend: Send + Sync + Debug {
    /// Get a pointer to the mapped memory region
    fn as_ptr(&self) -> *mut u8;

    /// Get the size of the mapped region in bytes
    fn size(&self) -> usize;

    /// Get the underlying handle
    fn raw_handle(&self) -> RawHandle;

    /// Remove the region's name so no new handle can attach to it. Existing
    /// mappings stay valid. A no-op for unnamed regions.
    fn unlink(&self) {}
}

/// Platform-specific handle type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawHandle {
    /// Anonymous process heap allocation.
    Heap,
    /// Unix file descriptor (Linux)
    Fd(i32),
}

/// Zeroed, aligned region on the process heap.
#[derive(Debug)]
pub struct HeapMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for HeapMemory {}
unsafe impl Sync for HeapMemory {}

impl HeapMemory {
    pub fn new(size: usize, align: usize) -> io::Result<Self> {
        let layout = Layout::from_size_align(size.max(1), align.max(1)).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("HeapMemory::new(): bad layout size={size} align={align}: {e}"),
            )
        })?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("HeapMemory::new(): cannot reserve {size} bytes"),
            )
        })?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl SharedMemoryBackend for HeapMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.layout.size()
    }

    fn raw_handle(&self) -> RawHandle {
        RawHandle::Heap
    }
}

/// Reserve a zeroed heap region.
pub fn create_heap_memory(size: usize, align: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(HeapMemory::new(size, align)?))
}

/// Create a new named shared memory region with the specified size.
///
/// Fails with `AlreadyExists` if a region with this name is already present.
/// The returned mapping unlinks the name when dropped.
#[cfg(target_os = "linux")]
pub fn create_shared_memory(size: usize, name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::create(size, name)?))
}

/// Attach to an existing named shared memory region.
///
/// `min_size` is validated against the region's real size.
#[cfg(target_os = "linux")]
pub fn attach_shared_memory(
    name: &str,
    min_size: usize,
) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::attach(name, min_size)?))
}

#[cfg(not(target_os = "linux"))]
pub fn create_shared_memory(_size: usize, _name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn attach_shared_memory(
    _name: &str,
    _min_size: usize,
) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(target_os = "linux")]
pub use linux::LinuxSharedMemory;

#[cfg(target_os = "linux")]
mod linux {
    use super::{RawHandle, SharedMemoryBackend};
    use std::fs::{self, OpenOptions};
    use std::io;
    use std::os::fd::{AsRawFd, IntoRawFd};
    use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
    use std::ptr::{self, NonNull};

    fn shm_path(name: &str) -> String {
        format!("/dev/shm/{}", name)
    }

    /// A `/dev/shm` file mapped `MAP_SHARED`.
    #[derive(Debug)]
    pub struct LinuxSharedMemory {
        ptr: NonNull<u8>,
        size: usize,
        fd: i32,
        path: String,
        /// Inode of the mapped file. The name is only removed while it still
        /// refers to this inode, never to a file created later under it.
        ino: u64,
        /// The creating handle unlinks the name on drop.
        owner: bool,
    }

    unsafe impl Send for LinuxSharedMemory {}
    unsafe impl Sync for LinuxSharedMemory {}

    impl LinuxSharedMemory {
        /// Create a new shared memory region using /dev/shm
        pub fn create(size: usize, name: &str) -> io::Result<Self> {
            let path = shm_path(name);

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
                let err = io::Error::last_os_error();
                let _ = fs::remove_file(&path);
                return Err(err);
            }

            let ino = match file.metadata() {
                Ok(meta) => meta.ino(),
                Err(e) => {
                    let _ = fs::remove_file(&path);
                    return Err(e);
                }
            };
            let fd = file.into_raw_fd();
            match unsafe { map(fd, size) } {
                Ok(ptr) => Ok(Self {
                    ptr,
                    size,
                    fd,
                    path,
                    ino,
                    owner: true,
                }),
                Err(e) => {
                    unsafe { libc::close(fd) };
                    let _ = fs::remove_file(&path);
                    Err(e)
                }
            }
        }

        /// Map an existing region created by another handle or process.
        pub fn attach(name: &str, min_size: usize) -> io::Result<Self> {
            let path = shm_path(name);
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

            let meta = file.metadata()?;
            let file_size = meta.len() as usize;
            if file_size < min_size || file_size == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "Shared memory size too small: expected at least {} bytes, got {}",
                        min_size, file_size
                    ),
                ));
            }

            let fd = file.into_raw_fd();
            match unsafe { map(fd, file_size) } {
                Ok(ptr) => Ok(Self {
                    ptr,
                    size: file_size,
                    fd,
                    path,
                    ino: meta.ino(),
                    owner: false,
                }),
                Err(e) => {
                    unsafe { libc::close(fd) };
                    Err(e)
                }
            }
        }
    }

    unsafe fn map(fd: i32, size: usize) -> io::Result<NonNull<u8>> {
        let ptr = libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        // mmap returns page-aligned addresses, which satisfies every zone alignment we hand out.
        NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))
    }

    impl Drop for LinuxSharedMemory {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
                libc::close(self.fd);
            }
            if self.owner {
                self.unlink();
            }
        }
    }

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

        fn unlink(&self) {
            if fs::metadata(&self.path).map_or(false, |meta| meta.ino() == self.ino) {
                let _ = fs::remove_file(&self.path);
            }
        }
    }
}
