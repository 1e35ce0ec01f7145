//! Device memory capability.
//!
//! The planner and executor never touch device memory directly; every
//! allocation, copy, and local fold goes through a `DeviceAdapter` chosen
//! at communicator construction. `CpuAdapter` treats host memory as the
//! device, which is what the in-process fabric and the test suites run on.

use crate::error::{HicollError, Result};
use crate::reduce::reduce_ptr;
use crate::types::{DataType, ReduceOp};

pub trait DeviceAdapter: Send + Sync {
    /// Allocate `bytes` of device memory.
    ///
    /// # Safety
    /// The returned address stays valid until `dealloc` with the same
    /// `(ptr, bytes)` pair.
    unsafe fn alloc(&self, bytes: usize) -> Result<u64>;

    /// Release an allocation made by `alloc`.
    ///
    /// # Safety
    /// `(ptr, bytes)` must come from a prior `alloc` on this adapter.
    unsafe fn dealloc(&self, ptr: u64, bytes: usize);

    /// Copy from device memory to a host buffer for a send.
    ///
    /// # Safety
    /// `ptr` must be valid for at least `bytes` bytes.
    unsafe fn stage_for_send(&self, ptr: u64, bytes: usize) -> Result<Vec<u8>>;

    /// Copy received host data into device memory.
    ///
    /// # Safety
    /// `dst_ptr` must be valid for at least `data.len()` bytes.
    unsafe fn receive_to_device(&self, data: &[u8], dst_ptr: u64) -> Result<()>;

    /// Device-to-device copy on this rank.
    ///
    /// # Safety
    /// `dst` and `src` must each be valid for `bytes` bytes.
    unsafe fn copy_within_device(&self, dst: u64, src: u64, bytes: usize) -> Result<()> {
        let staged = unsafe { self.stage_for_send(src, bytes)? };
        unsafe { self.receive_to_device(&staged, dst) }
    }

    /// In-place fold: `dst[i] = op(dst[i], src[i])` per element.
    ///
    /// # Safety
    /// `dst_ptr` must be valid for `count * dtype.size_in_bytes()` bytes.
    unsafe fn reduce_inplace(
        &self,
        dst_ptr: u64,
        src: &[u8],
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()>;
}

/// Host memory as the device.
#[derive(Debug, Default)]
pub struct CpuAdapter;

impl CpuAdapter {
    pub fn new() -> Self {
        Self
    }
}

const ALLOC_ALIGN: usize = 16;

impl DeviceAdapter for CpuAdapter {
    unsafe fn alloc(&self, bytes: usize) -> Result<u64> {
        let layout = std::alloc::Layout::from_size_align(bytes.max(1), ALLOC_ALIGN)
            .map_err(|e| HicollError::device(format!("bad layout for {bytes} bytes: {e}")))?;
        // Zero-initialized so staged reads are deterministic even on paths
        // that fill the buffer piecewise.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(HicollError::device(format!(
                "host allocation of {bytes} bytes failed"
            )));
        }
        Ok(ptr as u64)
    }

    unsafe fn dealloc(&self, ptr: u64, bytes: usize) {
        if ptr == 0 {
            return;
        }
        let layout = std::alloc::Layout::from_size_align(bytes.max(1), ALLOC_ALIGN)
            .expect("layout validated at alloc");
        unsafe { std::alloc::dealloc(ptr as *mut u8, layout) };
    }

    unsafe fn stage_for_send(&self, ptr: u64, bytes: usize) -> Result<Vec<u8>> {
        let src = unsafe { std::slice::from_raw_parts(ptr as *const u8, bytes) };
        Ok(src.to_vec())
    }

    unsafe fn receive_to_device(&self, data: &[u8], dst_ptr: u64) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst_ptr as *mut u8, data.len());
        }
        Ok(())
    }

    unsafe fn copy_within_device(&self, dst: u64, src: u64, bytes: usize) -> Result<()> {
        // Ranges may belong to the same user buffer; copy handles overlap.
        unsafe {
            std::ptr::copy(src as *const u8, dst as *mut u8, bytes);
        }
        Ok(())
    }

    unsafe fn reduce_inplace(
        &self,
        dst_ptr: u64,
        src: &[u8],
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        unsafe { reduce_ptr(dst_ptr, src, count, dtype, op) }
    }
}
