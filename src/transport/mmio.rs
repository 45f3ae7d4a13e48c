//! Memory-mapped I/O transport: maps a page-aligned physical window and
//! exposes aligned 32/64-bit access at in-page offsets. One mapping is
//! shared (via [`Arc`]) by every register that falls inside the same page.

use std::ptr;

use crate::error::{PcmError, Result};

pub struct MmioPage {
    base: *mut u8,
    len: usize,
    /// The page-aligned address and length actually passed to `mmap`;
    /// `munmap` must be called with these, not the offset-adjusted
    /// `base`/`len` used for in-page reads and writes.
    mapping_base: *mut u8,
    mapping_len: usize,
}

unsafe impl Send for MmioPage {}
unsafe impl Sync for MmioPage {}

impl MmioPage {
    /// Map `len` bytes of physical memory starting at the page containing
    /// `phys_addr`. `len` is rounded up to a multiple of the page size.
    pub fn map(phys_addr: u64, len: usize) -> Result<Self> {
        let page_size = 4096u64;
        let aligned_addr = phys_addr & !(page_size - 1);
        let page_offset = (phys_addr - aligned_addr) as usize;
        let map_len = ((page_offset + len + page_size as usize - 1) / page_size as usize) * page_size as usize;

        let path = std::ffi::CString::new("/dev/mem").unwrap();
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_SYNC) };
        if fd < 0 {
            return Err(PcmError::AccessDenied { transport: "mmio", context: "/dev/mem".into() });
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                aligned_addr as libc::off_t,
            )
        };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(PcmError::unknown("mmio", format!("mmap({phys_addr:#x}) failed")));
        }
        Ok(MmioPage {
            base: unsafe { (ptr as *mut u8).add(page_offset) },
            len: map_len - page_offset,
            mapping_base: ptr as *mut u8,
            mapping_len: map_len,
        })
    }

    fn check(&self, offset: usize, width: usize) {
        debug_assert!(offset + width <= self.len, "mmio access out of mapped range");
    }

    pub fn read32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        unsafe { ptr::read_volatile(self.base.add(offset) as *const u32) }
    }

    pub fn read64(&self, offset: usize) -> u64 {
        self.check(offset, 8);
        unsafe { ptr::read_volatile(self.base.add(offset) as *const u64) }
    }

    pub fn write32(&self, offset: usize, value: u32) {
        self.check(offset, 4);
        unsafe { ptr::write_volatile(self.base.add(offset) as *mut u32, value) }
    }

    pub fn write64(&self, offset: usize, value: u64) {
        self.check(offset, 8);
        unsafe { ptr::write_volatile(self.base.add(offset) as *mut u64, value) }
    }
}

impl Drop for MmioPage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mapping_base as *mut libc::c_void, self.mapping_len);
        }
    }
}
