//! Communication backend for collective operations.
//!
//! A backend owns at most one process group. Every collective here is
//! blocking and must be issued by all ranks in the same order; a rank that
//! skips one stalls the whole group.

use std::time::Duration;

use candle_core::{DType, Device, Tensor};
use serde::{de::DeserializeOwned, Serialize};

use super::error::{DistributedError, Result};
use super::topology::Rendezvous;

/// Optional arguments a backend understands.
///
/// Resolved once per backend instead of probing call signatures at runtime.
/// With `device_hint_on_init` the runtime passes the local rank to
/// [`CommBackend::form_group`]; with `device_hint_on_barrier` it passes it to
/// [`CommBackend::barrier`] when an accelerator is present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub device_hint_on_init: bool,
    pub device_hint_on_barrier: bool,
}

/// Arguments for forming a process group.
#[derive(Debug, Clone)]
pub struct GroupOptions {
    /// Backend name (e.g. "tcp").
    pub backend: String,
    /// Environment-based rendezvous endpoint.
    pub rendezvous: Rendezvous,
    /// Formation fails with [`DistributedError::Timeout`] after this long.
    pub timeout: Duration,
    pub rank: usize,
    pub world_size: usize,
    /// Device affinity hint. Backends that do not take one return
    /// [`DistributedError::UnsupportedOption`].
    pub device_hint: Option<usize>,
}

/// Trait for the process-group layer.
pub trait CommBackend: Send {
    /// Optional arguments this backend accepts.
    fn capabilities(&self) -> BackendCapabilities;

    /// Whether a group has been formed and not yet destroyed.
    fn is_initialized(&self) -> bool;

    /// Form the group. Blocks until every rank has joined or the timeout expires.
    fn form_group(&mut self, options: &GroupOptions) -> Result<()>;

    /// Broadcast raw bytes from `src_rank`.
    ///
    /// The source passes its payload; other ranks pass anything (usually
    /// empty) and receive the source's bytes.
    fn broadcast(&mut self, payload: Vec<u8>, src_rank: usize) -> Result<Vec<u8>>;

    /// Synchronize all ranks.
    fn barrier(&mut self, device_hint: Option<usize>) -> Result<()>;

    /// Tear the group down. A no-op if none exists.
    fn destroy_group(&mut self) -> Result<()>;
}

/// Broadcast a tensor from `src_rank`.
///
/// Every rank supplies a tensor of the same shape and dtype; the result has
/// the source's values on the caller's device.
pub fn broadcast_tensor(
    comm: &mut dyn CommBackend,
    tensor: &Tensor,
    src_rank: usize,
) -> Result<Tensor> {
    let bytes = comm.broadcast(tensor_to_bytes(tensor)?, src_rank)?;
    tensor_from_bytes(&bytes, tensor.dtype(), tensor.dims(), tensor.device())
}

/// Broadcast a serializable value from `src_rank` as one transfer.
///
/// The source passes `Some(value)`; every other rank passes `None`.
pub fn broadcast_object<T>(
    comm: &mut dyn CommBackend,
    value: Option<T>,
    src_rank: usize,
) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let payload = match &value {
        Some(v) => serde_json::to_vec(v)?,
        None => Vec::new(),
    };
    let bytes = comm.broadcast(payload, src_rank)?;
    if bytes.is_empty() {
        return Err(DistributedError::Protocol(format!(
            "rank {src_rank} broadcast an empty object"
        )));
    }
    Ok(serde_json::from_slice(&bytes)?)
}

fn tensor_to_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    let flat = tensor.flatten_all()?.to_device(&Device::Cpu)?;
    let bytes = match flat.dtype() {
        DType::U8 => flat.to_vec1::<u8>()?,
        DType::U32 => flat
            .to_vec1::<u32>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::I64 => flat
            .to_vec1::<i64>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::F32 => flat
            .to_vec1::<f32>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::F64 => flat
            .to_vec1::<f64>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        other => {
            return Err(DistributedError::Protocol(format!(
                "cannot broadcast tensors of dtype {other:?}"
            )))
        }
    };
    Ok(bytes)
}

fn tensor_from_bytes(bytes: &[u8], dtype: DType, dims: &[usize], device: &Device) -> Result<Tensor> {
    let elem_count: usize = dims.iter().product();
    let expected = elem_count * dtype.size_in_bytes();
    if bytes.len() != expected {
        return Err(DistributedError::Protocol(format!(
            "tensor payload is {} bytes, expected {expected}",
            bytes.len()
        )));
    }

    fn words<const N: usize>(bytes: &[u8]) -> impl Iterator<Item = [u8; N]> + '_ {
        bytes.chunks_exact(N).map(|c| {
            let mut word = [0u8; N];
            word.copy_from_slice(c);
            word
        })
    }

    let tensor = match dtype {
        DType::U8 => Tensor::from_vec(bytes.to_vec(), dims, device)?,
        DType::U32 => Tensor::from_vec(
            words::<4>(bytes).map(u32::from_le_bytes).collect::<Vec<_>>(),
            dims,
            device,
        )?,
        DType::I64 => Tensor::from_vec(
            words::<8>(bytes).map(i64::from_le_bytes).collect::<Vec<_>>(),
            dims,
            device,
        )?,
        DType::F32 => Tensor::from_vec(
            words::<4>(bytes).map(f32::from_le_bytes).collect::<Vec<_>>(),
            dims,
            device,
        )?,
        DType::F64 => Tensor::from_vec(
            words::<8>(bytes).map(f64::from_le_bytes).collect::<Vec<_>>(),
            dims,
            device,
        )?,
        other => {
            return Err(DistributedError::Protocol(format!(
                "cannot broadcast tensors of dtype {other:?}"
            )))
        }
    };
    Ok(tensor)
}
