/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Payload buffers.
//!
//! An [`IoBuffer`] describes the bytes a descriptor moves: either one
//! contiguous run of a virtually addressed [`Region`], or a list of page
//! fragments. Page fragments must be contiguous once mapped: only the
//! first may start part way into a page, and only the last may end short
//! of one.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use bytes::Bytes;

use crate::error::RaError;

pub const PAGE_SIZE: usize = 4096;

/// Byte storage backing payload buffers. Cloning shares the storage.
#[derive(Clone, Default)]
pub struct Region {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl Region {
    /// A zero-filled region of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the region's contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // A poisoned region still holds valid bytes.
        self.bytes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Region({} bytes)", self.len())
    }
}

#[derive(Debug, Clone)]
struct Fragment {
    region: Region,
    offset: usize,
    len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Virtual,
    Physical,
}

/// The payload of one transfer.
#[derive(Debug, Clone)]
pub struct IoBuffer {
    kind: BufferKind,
    frags: Vec<Fragment>,
}

impl IoBuffer {
    /// `nob` bytes of `region` starting at `offset`.
    pub fn virt(region: Region, offset: usize, nob: usize) -> Result<Self, RaError> {
        let len = region.len();
        if offset.checked_add(nob).map_or(true, |end| end > len) {
            return Err(RaError::InvalidBuffer(format!(
                "{}+{} exceeds region of {} bytes",
                offset, nob, len
            )));
        }
        Ok(Self {
            kind: BufferKind::Virtual,
            frags: vec![Fragment {
                region,
                offset,
                len: nob,
            }],
        })
    }

    /// A virtual buffer owning a copy of `bytes`.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let bytes = bytes.as_ref().to_vec();
        let len = bytes.len();
        Self {
            kind: BufferKind::Virtual,
            frags: vec![Fragment {
                region: Region::from_vec(bytes),
                offset: 0,
                len,
            }],
        }
    }

    /// Page fragments, each given as `(page, offset, len)`. Each page is a
    /// region of exactly [`PAGE_SIZE`] bytes.
    pub fn phys(pages: Vec<(Region, usize, usize)>) -> Result<Self, RaError> {
        let n = pages.len();
        let mut frags = Vec::with_capacity(n);
        for (i, (region, offset, len)) in pages.into_iter().enumerate() {
            if region.len() != PAGE_SIZE {
                return Err(RaError::InvalidBuffer(format!(
                    "page {} is {} bytes",
                    i,
                    region.len()
                )));
            }
            if offset + len > PAGE_SIZE || len == 0 {
                return Err(RaError::InvalidBuffer(format!(
                    "page {} fragment {}+{} out of range",
                    i, offset, len
                )));
            }
            if i != 0 && offset != 0 {
                return Err(RaError::InvalidBuffer(format!(
                    "can't make payload contiguous: page {} starts at offset {}",
                    i, offset
                )));
            }
            if i != n - 1 && offset + len != PAGE_SIZE {
                return Err(RaError::InvalidBuffer(format!(
                    "can't make payload contiguous: page {} ends at {}",
                    i,
                    offset + len
                )));
            }
            frags.push(Fragment {
                region,
                offset,
                len,
            });
        }
        Ok(Self {
            kind: BufferKind::Physical,
            frags,
        })
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Total number of bytes described.
    pub fn len(&self) -> usize {
        self.frags.iter().map(|f| f.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gather the described bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.len());
        for frag in &self.frags {
            let bytes = frag.region.lock();
            out.extend_from_slice(&bytes[frag.offset..frag.offset + frag.len]);
        }
        Bytes::from(out)
    }

    /// Scatter `data` into the buffer starting at byte `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), RaError> {
        if offset.checked_add(data.len()).map_or(true, |end| end > self.len()) {
            return Err(RaError::InvalidBuffer(format!(
                "write of {}+{} exceeds buffer of {} bytes",
                offset,
                data.len(),
                self.len()
            )));
        }
        let mut skip = offset;
        let mut data = data;
        for frag in &self.frags {
            if data.is_empty() {
                break;
            }
            if skip >= frag.len {
                skip -= frag.len;
                continue;
            }
            let n = (frag.len - skip).min(data.len());
            let start = frag.offset + skip;
            frag.region.lock()[start..start + n].copy_from_slice(&data[..n]);
            data = &data[n..];
            skip = 0;
        }
        Ok(())
    }
}
