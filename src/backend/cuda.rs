//! CUDA device adapter.
//!
//! Uses cudarc for device allocation and synchronous D2H/H2D staging; local
//! folds bounce through host memory, matching the staging path the
//! planner's compute commands take on CPU.

#![cfg(feature = "cuda")]

use std::sync::Arc;

use crate::backend::DeviceAdapter;
use crate::error::{HicollError, Result};
use crate::reduce::reduce_ptr;
use crate::types::{DataType, ReduceOp};

pub struct CudaAdapter {
    ctx: Arc<cudarc::driver::CudaContext>,
}

impl CudaAdapter {
    /// Create an adapter bound to the given GPU ordinal.
    pub fn new(device_ordinal: u32) -> Result<Self> {
        let ctx = cudarc::driver::CudaContext::new(device_ordinal as usize).map_err(|e| {
            HicollError::device(format!(
                "failed to create CUDA context for GPU {device_ordinal}: {e}"
            ))
        })?;
        Ok(Self { ctx })
    }

    fn bind(&self) -> Result<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| HicollError::device(format!("CUDA bind_to_thread failed: {e}")))
    }
}

impl DeviceAdapter for CudaAdapter {
    unsafe fn alloc(&self, bytes: usize) -> Result<u64> {
        self.bind()?;
        let ptr = unsafe { cudarc::driver::result::malloc_sync(bytes.max(1)) }
            .map_err(|e| HicollError::device(format!("cuMemAlloc of {bytes} bytes failed: {e}")))?;
        Ok(ptr as u64)
    }

    unsafe fn dealloc(&self, ptr: u64, _bytes: usize) {
        if ptr == 0 || self.bind().is_err() {
            return;
        }
        let _ = unsafe {
            cudarc::driver::result::free_sync(ptr as cudarc::driver::sys::CUdeviceptr)
        };
    }

    unsafe fn stage_for_send(&self, ptr: u64, bytes: usize) -> Result<Vec<u8>> {
        self.bind()?;
        let mut buf = vec![0u8; bytes];
        unsafe {
            cudarc::driver::result::memcpy_dtoh_sync(
                &mut buf,
                ptr as cudarc::driver::sys::CUdeviceptr,
            )
        }
        .map_err(|e| HicollError::device(format!("cuMemcpyDtoH failed: {e}")))?;
        Ok(buf)
    }

    unsafe fn receive_to_device(&self, data: &[u8], dst_ptr: u64) -> Result<()> {
        self.bind()?;
        unsafe {
            cudarc::driver::result::memcpy_htod_sync(
                dst_ptr as cudarc::driver::sys::CUdeviceptr,
                data,
            )
        }
        .map_err(|e| HicollError::device(format!("cuMemcpyHtoD failed: {e}")))?;
        Ok(())
    }

    unsafe fn copy_within_device(&self, dst: u64, src: u64, bytes: usize) -> Result<()> {
        self.bind()?;
        unsafe {
            cudarc::driver::result::memcpy_dtod_sync(
                dst as cudarc::driver::sys::CUdeviceptr,
                src as cudarc::driver::sys::CUdeviceptr,
                bytes,
            )
        }
        .map_err(|e| HicollError::device(format!("cuMemcpyDtoD failed: {e}")))?;
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
        let mut dst_host = unsafe { self.stage_for_send(dst_ptr, src.len())? };
        let host_ptr = dst_host.as_mut_ptr() as u64;
        unsafe { reduce_ptr(host_ptr, src, count, dtype, op)? };
        unsafe { self.receive_to_device(&dst_host, dst_ptr) }
    }
}
