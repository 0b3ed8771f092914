use crate::rpc::rpc_common::{Result, RpcError};
use crate::rpc::transport::{MdBuffer, MdHandle, MdOp, Region};

pub const PAGE_SIZE: usize = 4096;
/// Upper bound on pages in one bulk transfer.
pub const MAX_IOV: usize = 256;

/// Pages moved by one RPC's bulk phase.
///
/// A sink receives data, a source provides it. On the client a sink is posted
/// for remote PUT and a source for remote GET. The server drives the transfer
/// with the matching active operation.
#[derive(Debug)]
pub struct BulkDescriptor {
    pages: Vec<Region>,
    sink: bool,
    pub(crate) mdh: MdHandle,
}

impl BulkDescriptor {
    pub fn alloc(npages: usize, sink: bool) -> Result<Self> {
        if npages == 0 || npages > MAX_IOV {
            return Err(RpcError::InvalidArgument(format!(
                "bulk of {} pages, allowed 1..={}",
                npages, MAX_IOV
            )));
        }
        let mut pages = Vec::new();
        pages
            .try_reserve_exact(npages)
            .map_err(|_| RpcError::ResourceExhausted("bulk descriptor"))?;
        for _ in 0..npages {
            pages.push(Region::new(PAGE_SIZE)?);
        }
        Ok(BulkDescriptor { pages, sink, mdh: MdHandle::INVALID })
    }

    pub fn is_sink(&self) -> bool {
        self.sink
    }

    pub fn npages(&self) -> usize {
        self.pages.len()
    }

    pub fn len(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn pages(&self) -> &[Region] {
        &self.pages
    }

    /// Operation the peer performs against this descriptor when it is posted
    /// passively.
    pub(crate) fn passive_op(&self) -> MdOp {
        if self.sink {
            MdOp::Put
        } else {
            MdOp::Get
        }
    }

    /// Operation that moves data into (sink) or out of (source) this
    /// descriptor when it is the active side.
    pub(crate) fn active_op(&self) -> MdOp {
        if self.sink {
            MdOp::Get
        } else {
            MdOp::Put
        }
    }

    pub(crate) fn md_buffer(&self) -> MdBuffer {
        MdBuffer::new(self.pages.clone())
    }

    pub fn fill_pattern(&self, seed: u64) {
        for (idx, page) in self.pages.iter().enumerate() {
            page.with_mut(|bytes| {
                for (off, b) in bytes.iter_mut().enumerate() {
                    *b = pattern_byte(seed, idx, off);
                }
            });
        }
    }

    pub fn check_pattern(&self, seed: u64) -> bool {
        self.pages.iter().enumerate().all(|(idx, page)| {
            page.with(|bytes| {
                bytes
                    .iter()
                    .enumerate()
                    .all(|(off, b)| *b == pattern_byte(seed, idx, off))
            })
        })
    }
}

#[inline]
fn pattern_byte(seed: u64, page: usize, offset: usize) -> u8 {
    (seed as usize)
        .wrapping_add(page * PAGE_SIZE)
        .wrapping_add(offset)
        .wrapping_mul(31) as u8
}
