//! Accelerator discovery, device binding and seeding.
//!
//! The CUDA runtime is loaded at runtime so CPU-only hosts need no CUDA
//! install. Binding must happen before the process group forms; the
//! runtime enforces that ordering. The runtime opens the bound device once
//! and seeds that same handle, since every candle CUDA device carries its
//! own random generator.
//!
//! # Loading Order
//!
//! 1. `NNGPT_CUDART_SO_PATH` environment variable (if set)
//! 2. `libcudart.so.12` (CUDA 12.x)
//! 3. `libcudart.so.11` (CUDA 11.x)
//! 4. `libcudart.so` (default symlink)

use std::ffi::{c_char, c_int};
use std::sync::Arc;

use candle_core::Device;
use libloading::Library;

use super::error::{DistributedError, Result};

pub const CUDART_SO_PATH_ENV: &str = "NNGPT_CUDART_SO_PATH";

const CUDA_SUCCESS: c_int = 0;

type CudaSetDeviceFn = unsafe extern "C" fn(c_int) -> c_int;
type CudaGetDeviceCountFn = unsafe extern "C" fn(*mut c_int) -> c_int;
type CudaGetErrorStringFn = unsafe extern "C" fn(c_int) -> *const c_char;

/// Compute devices visible to this process.
pub trait Accelerator: Send + Sync {
    /// Number of visible devices.
    fn device_count(&self) -> usize;

    fn is_available(&self) -> bool {
        self.device_count() > 0
    }

    /// Bind the calling process to `device`.
    fn bind(&self, device: usize) -> Result<()>;

    /// Open the tensor device for `local_rank`. Called once, after [`bind`].
    ///
    /// [`bind`]: Accelerator::bind
    fn open_device(&self, local_rank: usize) -> Result<Device>;

    /// Seed the device-side random generator of `device`.
    fn seed_device(&self, device: &Device, seed: u64) -> Result<()>;
}

/// CPU-only host.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAccelerator;

impl Accelerator for NoAccelerator {
    fn device_count(&self) -> usize {
        0
    }

    fn bind(&self, device: usize) -> Result<()> {
        Err(DistributedError::Accelerator(format!(
            "cannot bind device {device}: no accelerator present"
        )))
    }

    fn open_device(&self, _local_rank: usize) -> Result<Device> {
        Ok(Device::Cpu)
    }

    fn seed_device(&self, _device: &Device, _seed: u64) -> Result<()> {
        Ok(())
    }
}

/// Dynamically loaded CUDA runtime.
pub struct CudaRuntime {
    #[allow(dead_code)]
    library: Library,
    set_device: CudaSetDeviceFn,
    get_error_string: CudaGetErrorStringFn,
    device_count: usize,
}

impl CudaRuntime {
    /// Load the CUDA runtime library and count devices.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CUDART_SO_PATH_ENV) {
            match Self::from_path(&path) {
                Ok(rt) => {
                    tracing::debug!(path = %path, "loaded CUDA runtime from {CUDART_SO_PATH_ENV}");
                    return Ok(rt);
                }
                Err(e) => tracing::warn!(
                    path = %path,
                    error = %e,
                    "{CUDART_SO_PATH_ENV} set but failed to load, trying default paths"
                ),
            }
        }

        for lib_name in ["libcudart.so.12", "libcudart.so.11", "libcudart.so"] {
            if let Ok(rt) = Self::from_path(lib_name) {
                tracing::debug!(library = %lib_name, devices = rt.device_count, "loaded CUDA runtime");
                return Ok(rt);
            }
        }

        Err(DistributedError::Accelerator(format!(
            "failed to load CUDA runtime library. Tried: {CUDART_SO_PATH_ENV} env var, \
             libcudart.so.12, libcudart.so.11, libcudart.so"
        )))
    }

    fn from_path(path: &str) -> Result<Self> {
        let library = unsafe { Library::new(path) }
            .map_err(|e| DistributedError::Accelerator(format!("failed to load {path}: {e}")))?;

        let (set_device, get_device_count, get_error_string) = unsafe {
            let set_device: libloading::Symbol<CudaSetDeviceFn> = library
                .get(b"cudaSetDevice")
                .map_err(|e| DistributedError::Accelerator(format!("cudaSetDevice: {e}")))?;
            let get_device_count: libloading::Symbol<CudaGetDeviceCountFn> = library
                .get(b"cudaGetDeviceCount")
                .map_err(|e| DistributedError::Accelerator(format!("cudaGetDeviceCount: {e}")))?;
            let get_error_string: libloading::Symbol<CudaGetErrorStringFn> = library
                .get(b"cudaGetErrorString")
                .map_err(|e| DistributedError::Accelerator(format!("cudaGetErrorString: {e}")))?;
            (*set_device, *get_device_count, *get_error_string)
        };

        // A driver/runtime mismatch reports an error here; treat it as zero devices.
        let mut count: c_int = 0;
        let status = unsafe { get_device_count(&mut count) };
        let device_count = if status == CUDA_SUCCESS {
            count.max(0) as usize
        } else {
            0
        };

        Ok(Self {
            library,
            set_device,
            get_error_string,
            device_count,
        })
    }

    fn error_string(&self, error: c_int) -> String {
        let ptr = unsafe { (self.get_error_string)(error) };
        if ptr.is_null() {
            return format!("unknown CUDA error: {error}");
        }
        unsafe { std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned() }
    }
}

// Safety: only function pointers and the library handle that keeps them alive.
unsafe impl Send for CudaRuntime {}
unsafe impl Sync for CudaRuntime {}

impl Accelerator for CudaRuntime {
    fn device_count(&self) -> usize {
        self.device_count
    }

    fn bind(&self, device: usize) -> Result<()> {
        if device >= self.device_count {
            return Err(DistributedError::Accelerator(format!(
                "device {device} requested but only {} visible",
                self.device_count
            )));
        }
        let status = unsafe { (self.set_device)(device as c_int) };
        if status != CUDA_SUCCESS {
            return Err(DistributedError::Accelerator(format!(
                "cudaSetDevice({device}) failed: {} ({status})",
                self.error_string(status)
            )));
        }
        Ok(())
    }

    fn open_device(&self, local_rank: usize) -> Result<Device> {
        // CPU when candle was built without its CUDA backend.
        Ok(Device::cuda_if_available(local_rank)?)
    }

    fn seed_device(&self, device: &Device, seed: u64) -> Result<()> {
        if device.is_cuda() {
            device.set_seed(seed)?;
        }
        Ok(())
    }
}

/// Probe for a usable accelerator, falling back to [`NoAccelerator`].
pub fn detect() -> Arc<dyn Accelerator> {
    match CudaRuntime::load() {
        Ok(rt) if rt.device_count() > 0 => Arc::new(rt),
        Ok(_) => {
            tracing::debug!("CUDA runtime loaded but no devices visible");
            Arc::new(NoAccelerator)
        }
        Err(e) => {
            tracing::debug!(error = %e, "no CUDA runtime, running CPU-only");
            Arc::new(NoAccelerator)
        }
    }
}
