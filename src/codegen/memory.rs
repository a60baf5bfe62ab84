//! Executable code buffers and aligned arena storage.

use crate::error::{Error, Result};

/// A block of executable memory holding finalised machine code.
///
/// The buffer is mapped read/write, filled, then flipped to read/execute for
/// the lifetime of the instance and unmapped on drop.
pub struct CodeBuffer {
    ptr: *mut u8,
    len: usize,
}

// The code is immutable once mapped executable.
unsafe impl Send for CodeBuffer {}

impl CodeBuffer {
    pub fn new(code: &[u8]) -> Result<CodeBuffer> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = code.len().max(1).div_ceil(page) * page;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Compile("mmap of code buffer failed".into()));
        }
        let ptr = ptr as *mut u8;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            if libc::mprotect(ptr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_EXEC) != 0
            {
                libc::munmap(ptr as *mut libc::c_void, len);
                return Err(Error::Compile("mprotect of code buffer failed".into()));
            }
        }
        Ok(CodeBuffer { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Entry point of the compiled function.
    ///
    /// # Safety
    /// The buffer must contain a complete function with a C ABI and no
    /// arguments, as produced by the compilation driver.
    pub unsafe fn entry(&self) -> extern "C" fn() {
        std::mem::transmute::<*mut u8, extern "C" fn()>(self.ptr)
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// 64-byte aligned, zero-initialised float storage for tensor arenas and
/// constant tables. Addresses are stable for the lifetime of the buffer.
pub struct AlignedBuffer {
    ptr: *mut f32,
    floats: usize,
}

unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    pub fn zeroed(floats: usize) -> AlignedBuffer {
        let floats = floats.max(4);
        let layout = Self::layout(floats);
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) } as *mut f32;
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        AlignedBuffer { ptr, floats }
    }

    fn layout(floats: usize) -> std::alloc::Layout {
        std::alloc::Layout::from_size_align(floats * 4, 64).expect("arena layout")
    }

    pub fn len(&self) -> usize {
        self.floats
    }

    pub fn is_empty(&self) -> bool {
        self.floats == 0
    }

    pub fn as_ptr(&self) -> *const f32 {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut f32 {
        self.ptr
    }

    /// Address of the float at `offset`, for baking into emitted code.
    pub fn address(&self, offset: usize) -> u64 {
        debug_assert!(offset <= self.floats);
        self.ptr as u64 + (offset * 4) as u64
    }

    pub fn as_slice(&self) -> &[f32] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.floats) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.floats) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe {
            std::alloc::dealloc(self.ptr as *mut u8, Self::layout(self.floats));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_buffer_is_aligned_and_zeroed() {
        let buf = AlignedBuffer::zeroed(33);
        assert_eq!(buf.as_ptr() as usize % 64, 0);
        assert!(buf.as_slice().iter().all(|&x| x == 0.0));
        assert_eq!(buf.address(4) - buf.address(0), 16);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn code_buffer_executes() {
        // ret
        let code = [0xc3u8];
        let buf = CodeBuffer::new(&code).unwrap();
        let f = unsafe { buf.entry() };
        f();
    }
}
