//! Sparse, demand-grown byte store
//!
//! The address space is cut into index nodes ("qsets"), each holding `qset`
//! optional quanta of `quantum` bytes:
//!
//! ```text
//!  nodes[0]                 nodes[1]
//!  ┌──────────────┐         ┌──────────────┐
//!  │ data ─┐      │  ───▶   │ data: None   │  ───▶ ...
//!  └───────┼──────┘         └──────────────┘
//!          ▼
//!   [q0][None][q2]...[None]          (qset slots)
//!    │          │
//!    ▼          ▼
//!  quantum    quantum                (zero-initialised on allocation)
//! ```
//!
//! A read or write never crosses a quantum boundary; callers loop.
//!
//! Reading inside `size` where the quantum was never allocated yields zero
//! bytes rather than zero-filled content. Bytes of an allocated quantum that
//! were never written read back as zeros.

use crate::error::{DeviceError, Result};

/// Quantum/qset pair a store is laid out with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub quantum: usize,
    pub qset: usize,
}

impl Geometry {
    /// Bytes addressed by one index node
    #[must_use]
    pub fn node_span(&self) -> usize {
        self.quantum * self.qset
    }

    /// Split an offset into (node index, quantum index, offset in quantum)
    #[must_use]
    pub fn locate(&self, offset: usize) -> (usize, usize, usize) {
        let span = self.node_span();
        let item = offset / span;
        let rest = offset % span;
        (item, rest / self.quantum, rest % self.quantum)
    }
}

#[derive(Debug, Default)]
struct Qset {
    data: Option<Vec<Option<Box<[u8]>>>>,
}

#[derive(Debug)]
pub struct SparseStore {
    geometry: Geometry,
    nodes: Vec<Qset>,
    size: usize,
}

impl SparseStore {
    /// Create an empty store. `quantum` and `qset` must be non-zero.
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        debug_assert!(geometry.quantum > 0 && geometry.qset > 0);
        Self {
            geometry,
            nodes: Vec::new(),
            size: 0,
        }
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// One past the highest byte ever written
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of quanta currently backed by memory
    #[must_use]
    pub fn allocated_quanta(&self) -> usize {
        self.nodes
            .iter()
            .filter_map(|node| node.data.as_ref())
            .map(|slots| slots.iter().filter(|q| q.is_some()).count())
            .sum()
    }

    /// Copy bytes at `offset` into `buf`, stopping at the end of the quantum.
    ///
    /// Returns 0 at or past `size`, and for a quantum that was never
    /// allocated.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> usize {
        if offset >= self.size || buf.is_empty() {
            return 0;
        }
        let count = buf.len().min(self.size - offset);
        let (item, s_pos, q_pos) = self.geometry.locate(offset);

        let Some(quantum) = self
            .nodes
            .get(item)
            .and_then(|node| node.data.as_ref())
            .and_then(|slots| slots.get(s_pos))
            .and_then(|slot| slot.as_deref())
        else {
            log::debug!("sparse.read: hole at offset {offset} (node {item}, quantum {s_pos})");
            return 0;
        };

        let count = count.min(self.geometry.quantum - q_pos);
        buf[..count].copy_from_slice(&quantum[q_pos..q_pos + count]);
        count
    }

    /// Copy bytes from `data` to `offset`, stopping at the end of the quantum.
    ///
    /// Allocates missing nodes, the node's slot array and the quantum itself.
    ///
    /// # Errors
    /// - `InvalidAddress` if `offset + data.len()` overflows
    /// - `OutOfMemory` if an allocation fails; the store is left unchanged
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        offset
            .checked_add(data.len())
            .ok_or(DeviceError::InvalidAddress)?;

        let geometry = self.geometry;
        let (item, s_pos, q_pos) = geometry.locate(offset);

        // Allocate everything first so a failure leaves nothing half-built
        if self.nodes.len() <= item {
            self.nodes.try_reserve_exact(item + 1 - self.nodes.len())?;
        }
        let needs_slots = self.nodes.get(item).map_or(true, |node| node.data.is_none());
        let new_slots = if needs_slots {
            let mut slots = Vec::new();
            slots.try_reserve_exact(geometry.qset)?;
            slots.resize_with(geometry.qset, || None);
            Some(slots)
        } else {
            None
        };
        let needs_quantum = new_slots.is_some()
            || self
                .nodes
                .get(item)
                .and_then(|node| node.data.as_ref())
                .map_or(true, |slots| slots[s_pos].is_none());
        let new_quantum = if needs_quantum {
            let mut quantum = Vec::new();
            quantum.try_reserve_exact(geometry.quantum)?;
            quantum.resize(geometry.quantum, 0u8);
            Some(quantum.into_boxed_slice())
        } else {
            None
        };

        // Commit: capacity is reserved, nothing below allocates for the chain
        if self.nodes.len() <= item {
            self.nodes.resize_with(item + 1, Qset::default);
        }
        let node = &mut self.nodes[item];
        if let Some(slots) = new_slots {
            node.data = Some(slots);
        }
        let slots = node.data.get_or_insert_with(Vec::new);
        if let Some(quantum) = new_quantum {
            slots[s_pos] = Some(quantum);
        }
        let Some(quantum) = slots[s_pos].as_deref_mut() else {
            debug_assert!(false, "quantum must exist after allocation");
            return Err(DeviceError::OutOfMemory);
        };

        let count = data.len().min(geometry.quantum - q_pos);
        quantum[q_pos..q_pos + count].copy_from_slice(&data[..count]);

        let end = offset + count;
        if self.size < end {
            self.size = end;
        }
        log::debug!("sparse.write: {count} bytes at offset {offset}, size now {}", self.size);
        Ok(count)
    }

    /// Release every node and quantum and reset the size to 0
    pub fn trim(&mut self) {
        self.nodes = Vec::new();
        self.size = 0;
    }
}
