#[cfg(windows)]
pub mod _win {
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE},
    };

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub const fn uninit() -> Self {
            Self {
                start: null_mut(),
                end: null_mut(),
                size: 0,
            }
        }

        pub fn new(size: usize) -> Option<Self> {
            unsafe {
                let mem = VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
                if mem.is_null() {
                    return None;
                }
                let mem = mem as *mut u8;
                let end = mem.add(size);

                Some(Self {
                    start: mem,
                    end,
                    size,
                })
            }
        }

        /// Return an `align`-aligned pointer into the mapped region.
        /// `align` must be a power of two, and the map must have been
        /// over-reserved by at least `align` bytes.
        pub fn aligned(&self, align: usize) -> *mut u8 {
            let offset = align - (self.start as usize) % align;
            unsafe { self.start.add(offset) as *mut u8 }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }

        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualFree(page.cast(), size, MEM_DECOMMIT);
            }
        }

        pub fn commit(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualAlloc(page.cast(), size, MEM_COMMIT, PAGE_READWRITE);
            }
        }

        /// Revoke all access to the given page range. Used for guard regions.
        pub fn protect_none(&self, page: *mut u8, size: usize) {
            unsafe {
                let mut old = 0;
                VirtualProtect(page.cast(), size, PAGE_NOACCESS, &mut old);
            }
        }

        pub const fn size(&self) -> usize {
            self.size
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            if self.start.is_null() {
                return;
            }
            unsafe {
                VirtualFree(self.start.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    use std::ptr::null_mut;

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub const fn size(&self) -> usize {
            self.size
        }

        pub const fn uninit() -> Self {
            Self {
                start: null_mut(),
                end: null_mut(),
                size: 0,
            }
        }

        pub fn new(size: usize) -> Option<Self> {
            unsafe {
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    size as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    return None;
                }
                Some(Self {
                    start: map as *mut u8,
                    end: (map as usize + size) as *mut u8,
                    size,
                })
            }
        }

        /// Return an `align`-aligned pointer into the mapped region.
        /// `align` must be a power of two, and the map must have been
        /// over-reserved by at least `align` bytes.
        pub fn aligned(&self, align: usize) -> *mut u8 {
            let offset = align - (self.start as usize) % align;
            unsafe { self.start.add(offset) as *mut u8 }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }

        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
            }
        }

        pub fn commit(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(
                    page as *mut _,
                    size as _,
                    libc::MADV_WILLNEED | libc::MADV_SEQUENTIAL,
                );
            }
        }

        /// Revoke all access to the given page range. Used for guard regions.
        pub fn protect_none(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::mprotect(page as *mut _, size as _, libc::PROT_NONE);
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            if self.start.is_null() {
                return;
            }
            unsafe {
                libc::munmap(self.start() as *mut _, self.size as _);
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;
