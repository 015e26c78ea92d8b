//! Host memory-mapping primitives shared by the guest address space and the
//! [`crate::cache::LookupCache`]'s backing reservation.
//!
//! Generalized from the teacher's 32-bit ARM `MemRegion` (a single
//! `shm_open`+`mmap`-backed slab at a fixed guest-physical offset) into two
//! pieces: [`MemRegion`], unchanged in spirit, for guest memory; and
//! [`Reservation`], a plain anonymous `mmap` the lookup cache sizes to
//! `virtual_mem_size/4096 * 8 + code_backing + L1_size` (spec §4.5) and
//! commits lazily, since unlike guest memory it doesn't need a backing file
//! descriptor — MADV_DONTNEED is enough to let the kernel reclaim pages on
//! a full cache flush.

use std::convert::TryInto;
use std::ffi::CString;

use libc::{
    c_char, c_void, ftruncate, madvise, mmap, mprotect, shm_open, shm_unlink, MADV_DONTNEED, MAP_ANONYMOUS,
    MAP_FAILED, MAP_FIXED, MAP_PRIVATE, MAP_SHARED, O_CREAT, O_EXCL, O_RDWR, PROT_EXEC, PROT_NONE, PROT_READ,
    PROT_WRITE,
};

#[allow(dead_code)]
pub struct MemRegion {
    pub ptr: &'static mut [u8],
    pub addr: u64,
    pub len: usize,
    fd: i32,
}

/// Base virtual address guest memory is anchored at on the host. Chosen
/// (as in the teacher) to sit well away from the host executable, heap, and
/// any `mmap`-randomized region.
pub const GUEST_MEM_BASE: usize = 0x0000_1337_0000_0000;

impl MemRegion {
    pub fn new(name: &str, addr: u64, len: usize) -> Self {
        let address = GUEST_MEM_BASE + addr as usize;
        let name = CString::new(name).unwrap();
        let fd = unsafe { MemRegion::create_shm(name.as_ptr(), len) };
        let ptr = unsafe { MemRegion::mmap(fd, address, len) };
        MemRegion { ptr, addr, len, fd }
    }

    unsafe fn create_shm(name: *const c_char, len: usize) -> i32 {
        let fd = shm_open(name, O_RDWR | O_CREAT | O_EXCL, 0o600);
        if fd < 0 {
            panic!("shm_open for object {:?} failed", name);
        }
        shm_unlink(name);
        if ftruncate(fd, len.try_into().unwrap()) < 0 {
            panic!("ftruncate() for {:?} ({:x?} bytes) failed", name, len);
        }
        fd
    }

    unsafe fn mmap(shm_fd: i32, vaddr: usize, len: usize) -> &'static mut [u8] {
        let addr = vaddr as *mut c_void;
        let res = mmap(addr, len, PROT_READ | PROT_WRITE | PROT_EXEC, MAP_FIXED | MAP_SHARED, shm_fd, 0);
        if res == MAP_FAILED {
            panic!("mmap() failed {:?}", addr);
        }
        std::slice::from_raw_parts_mut(res as *mut u8, len)
    }

    pub fn write_buf(&mut self, off: u64, buf: &[u8]) {
        let off = off as usize;
        self.ptr[off..off + buf.len()].copy_from_slice(buf);
    }
    pub fn read_bytes(&self, off: u64, len: usize) -> Vec<u8> {
        let off = off as usize;
        self.ptr[off..off + len].to_vec()
    }
    pub fn read64(&self, off: usize) -> u64 {
        u64::from_le_bytes(self.ptr[off..off + 8].try_into().unwrap())
    }
    pub fn read32(&self, off: usize) -> u32 {
        u32::from_le_bytes(self.ptr[off..off + 4].try_into().unwrap())
    }
    pub fn read16(&self, off: usize) -> u16 {
        u16::from_le_bytes(self.ptr[off..off + 2].try_into().unwrap())
    }
    pub fn read8(&self, off: usize) -> u8 {
        self.ptr[off]
    }
}

/// A view of guest memory `decode::GuestMemory` can read through, backed by
/// a single flat [`MemRegion`]. Reads of unmapped bytes (past the end of
/// the loaded image) return `None`, matching spec §4.1's "unmapped guest
/// page" decode failure rather than silently zero-filling like
/// `MemRegion::read_bytes`'s test-only counterpart.
pub struct GuestAddressSpace {
    pub region: MemRegion,
}
impl GuestAddressSpace {
    pub fn new(len: usize) -> Self {
        GuestAddressSpace { region: MemRegion::new("nil-guest", 0, len) }
    }
}
impl crate::decode::GuestMemory for GuestAddressSpace {
    fn read_bytes(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let end = (addr as usize).checked_add(len)?;
        if end > self.region.len {
            return None;
        }
        Some(self.region.read_bytes(addr, len))
    }
}

/// A reserved-but-not-yet-backed anonymous mapping: `PROT_NONE` at
/// reservation time, committed page range by page range as the lookup
/// cache's `PageMemory`/`L1Pointer`/`PagePointer` regions are touched, and
/// released in bulk via `MADV_DONTNEED` on a full flush (spec §4.5).
pub struct Reservation {
    pub ptr: *mut u8,
    pub len: usize,
}
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

impl Reservation {
    pub fn new(len: usize) -> Self {
        let res = unsafe {
            mmap(std::ptr::null_mut(), len, PROT_NONE, MAP_PRIVATE | MAP_ANONYMOUS, -1, 0)
        };
        if res == MAP_FAILED {
            panic!("mmap() reservation of {:#x} bytes failed", len);
        }
        Reservation { ptr: res as *mut u8, len }
    }

    /// Commit `[offset, offset+len)` for read/write, lazily backing it with
    /// zeroed pages.
    pub fn commit(&self, offset: usize, len: usize) {
        assert!(offset + len <= self.len);
        let addr = unsafe { self.ptr.add(offset) as *mut c_void };
        let rc = unsafe { mprotect(addr, len, PROT_READ | PROT_WRITE) };
        if rc != 0 {
            panic!("mprotect(commit) failed at offset {:#x}", offset);
        }
    }

    /// Release the backing pages of `[offset, offset+len)` without
    /// unmapping the reservation — the region goes back to reading as
    /// zero-filled once re-touched, matching `ClearL2Cache`'s "L1 is not
    /// explicitly touched, callers must zero it" note (spec §4.5).
    pub fn decommit(&self, offset: usize, len: usize) {
        assert!(offset + len <= self.len);
        let addr = unsafe { self.ptr.add(offset) as *mut c_void };
        let rc = unsafe { madvise(addr, len, MADV_DONTNEED) };
        if rc != 0 {
            panic!("madvise(DONTNEED) failed at offset {:#x}", offset);
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_commit_then_write_then_decommit_roundtrip() {
        let page = 4096;
        let mut res = Reservation::new(page * 4);
        res.commit(0, page);
        res.as_mut_slice()[0] = 0xAB;
        assert_eq!(res.as_slice()[0], 0xAB);
        res.decommit(0, page);
        // Touching it again after DONTNEED is valid (still committed,
        // reads back zero) since we never called mprotect(PROT_NONE).
        assert_eq!(res.as_slice()[0], 0);
    }
}
