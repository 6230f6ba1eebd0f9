//! Bounded message memory for the port chains.
//!
//! The arena is a fixed byte area carved into equal units. A message takes
//! the first run of free units long enough to hold it and is addressed by
//! its [`Block`] (an offset, not a pointer) until it is freed.

use crate::error::PortError;
use log::warn;

/// A message stored in an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    unit: usize,
    units: usize,
    len: usize,
}

impl Block {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct Arena {
    name: &'static str,
    unit_bytes: usize,
    bytes: Vec<u8>,
    used: Vec<bool>,
}

impl Arena {
    /// # Panics
    ///
    /// Panics if `unit_bytes` is zero or larger than `total_bytes`.
    pub fn new(name: &'static str, total_bytes: usize, unit_bytes: usize) -> Self {
        assert!(
            unit_bytes > 0 && unit_bytes <= total_bytes,
            "arena {} unit of {} bytes does not fit {} bytes",
            name,
            unit_bytes,
            total_bytes
        );
        let units = total_bytes / unit_bytes;
        Self {
            name,
            unit_bytes,
            bytes: vec![0; units * unit_bytes],
            used: vec![false; units],
        }
    }

    /// Store `parts` back to back as one message.
    pub fn write(&mut self, parts: &[&[u8]]) -> Result<Block, PortError> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        let units = len.div_ceil(self.unit_bytes).max(1);
        let Some(unit) = self.first_fit(units) else {
            warn!(
                "arena {}: no room for {} bytes ({} of {} bytes used)",
                self.name,
                len,
                self.used_bytes(),
                self.capacity()
            );
            return Err(PortError::NoMemory);
        };

        self.used[unit..unit + units].fill(true);
        let mut at = unit * self.unit_bytes;
        for part in parts {
            self.bytes[at..at + part.len()].copy_from_slice(part);
            at += part.len();
        }
        Ok(Block { unit, units, len })
    }

    pub fn read(&self, block: &Block) -> &[u8] {
        let start = block.unit * self.unit_bytes;
        &self.bytes[start..start + block.len]
    }

    pub fn free(&mut self, block: Block) {
        self.used[block.unit..block.unit + block.units].fill(false);
    }

    /// Copy a message out and free it.
    pub fn take(&mut self, block: Block) -> Vec<u8> {
        let data = self.read(&block).to_vec();
        self.free(block);
        data
    }

    pub fn used_bytes(&self) -> usize {
        self.used.iter().filter(|u| **u).count() * self.unit_bytes
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn first_fit(&self, units: usize) -> Option<usize> {
        let mut run = 0;
        for (i, used) in self.used.iter().enumerate() {
            if *used {
                run = 0;
                continue;
            }
            run += 1;
            if run == units {
                return Some(i + 1 - units);
            }
        }
        None
    }
}
