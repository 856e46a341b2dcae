//! Halo exchange of fixed-stride per-vertex data.
//!
//! Used by the smoother between colour bags to push updated coordinates and
//! metrics of shared vertices to the ranks mirroring them. The exchange is
//! receiver-posted-first: all receives go up, then all sends, then receives
//! are drained and scattered, then sends are waited.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::mesh_error::MeshAdaptError;

/// Exchange `stride` f64 values per listed vertex. `send[p]` are owned
/// vertices mirrored on rank `p`; `recv[p]` are local mirrors whose values
/// rank `p` owns. Slot order within each list is the shared pairing.
pub fn halo_update<C: Communicator>(
    comm: &C,
    send: &[Vec<usize>],
    recv: &[Vec<usize>],
    stride: usize,
    data: &mut [f64],
    tag: CommTag,
) -> Result<(), MeshAdaptError> {
    let size = comm.size();
    let rank = comm.rank();
    if size == 1 {
        return Ok(());
    }

    let mut recv_handles = Vec::new();
    for (p, list) in recv.iter().enumerate().take(size) {
        if p == rank || list.is_empty() {
            continue;
        }
        let mut template = vec![0u8; list.len() * stride * 8];
        recv_handles.push((p, comm.irecv(p, tag.as_u16(), &mut template)));
    }

    let mut send_handles = Vec::new();
    for (p, list) in send.iter().enumerate().take(size) {
        if p == rank || list.is_empty() {
            continue;
        }
        let mut buf: Vec<f64> = Vec::with_capacity(list.len() * stride);
        for &v in list {
            buf.extend_from_slice(&data[v * stride..(v + 1) * stride]);
        }
        send_handles.push(comm.isend(p, tag.as_u16(), bytemuck::cast_slice(&buf)));
    }

    for (p, handle) in recv_handles {
        let bytes = handle
            .wait()
            .ok_or(MeshAdaptError::TruncatedHaloMessage(p))?;
        if bytes.len() < recv[p].len() * stride * 8 {
            return Err(MeshAdaptError::TruncatedHaloMessage(p));
        }
        let mut chunks = bytes.chunks_exact(8);
        for &v in &recv[p] {
            for k in 0..stride {
                let c = chunks.next().ok_or(MeshAdaptError::TruncatedHaloMessage(p))?;
                data[v * stride + k] =
                    f64::from_le_bytes(c.try_into().expect("8-byte chunk"));
            }
        }
    }

    for handle in send_handles {
        handle.wait();
    }
    Ok(())
}
