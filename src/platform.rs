//! Hosted memory source for root arenas. Embedded targets hand their own
//! range to [`crate::MemoryContext::bootstrap`] and never touch this module.

use std::{ptr::NonNull, sync::OnceLock};

use crate::{align::align_up, Pointer};

/// Abstraction for platform specific memory handling. We only need to map a
/// root arena once and give it back when the context goes away, we don't care
/// about the APIs offered by the underlying kernel or libraries.
trait PlatformSpecificMemory {
    /// Requests a memory region from the kernel where `length` bytes can be
    /// written safely.
    unsafe fn request_memory(length: usize) -> Pointer<u8>;

    /// Returns `length` bytes starting from `address` to the underlying
    /// kernel. Always called with a whole arena.
    unsafe fn return_memory(address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
struct Platform;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Virtual memory page size. 4096 bytes on most computers, but we only know
/// at runtime.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| unsafe { Platform::page_size() })
}

/// A page rounded range obtained from the OS. Unmapped on drop, so the
/// context owning it must not hand out its memory past that point.
#[derive(Debug)]
pub struct PlatformArena {
    address: NonNull<u8>,
    length: usize,
}

impl PlatformArena {
    /// Maps at least `size` bytes, rounded up to the page size. `None` if the
    /// OS refuses.
    pub fn map(size: usize) -> Option<Self> {
        let length = align_up(size.max(1), page_size())?;
        let address = unsafe { Platform::request_memory(length)? };

        log::debug!("mapped {length} bytes at {address:p}");

        Some(Self { address, length })
    }

    pub fn start(&self) -> NonNull<u8> {
        self.address
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl Drop for PlatformArena {
    fn drop(&mut self) {
        unsafe { Platform::return_memory(self.address, self.length) };
        log::debug!("unmapped {} bytes at {:p}", self.length, self.address);
    }
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Memory protection. Read-Write only.
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            // Memory should be private to our process and not mapped to any file.
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            // For all the configuration options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => NonNull::new(address.cast()),
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                log::warn!("munmap of {length} bytes at {address:p} failed, arena leaked");
            }
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Similar to mmap on Linux, Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            // Memory has to be reserved first and then committed in order to
            // become usable. We can do both at the same time with one call.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            // For more detailed explanations of each parameter, see
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc#parameters
            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            // Length must be 0 with MEM_RELEASE, the whole reservation goes.
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree#parameters
            if !Memory::VirtualFree(address.cast().as_ptr(), 0, Memory::MEM_RELEASE).as_bool() {
                log::warn!("VirtualFree of {length} bytes at {address:p} failed, arena leaked");
            }
        }

        unsafe fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri, we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so instead we'll use the global allocator to
    //! mock low level memory managament. This is also useful for detecting
    //! arenas that are never given back.

    use std::{alloc, ptr::NonNull};

    use super::{page_size, Platform, PlatformSpecificMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> Option<alloc::Layout> {
        alloc::Layout::from_size_align(length, page_size()).ok()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length)?))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            if let Some(layout) = to_layout(length) {
                alloc::dealloc(address.as_ptr(), layout);
            }
        }

        unsafe fn page_size() -> usize {
            4096
        }
    }
}
