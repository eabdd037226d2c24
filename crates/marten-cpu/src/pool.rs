// Dynamic Memory Pool — best-fit allocator over a fixed device budget
//
// The pool hands out addresses, not buffers: kernels and the profiler use it
// to account for where tensors would live in device memory and how much of
// the budget is in use, fragmented, or idle.
//
// Device memory is requested in blocks. A block starts at `unit_size` bytes
// and doubles until it covers the request, capped at what is left of the
// budget. Each block is carved into bufs:
//
//   block @0x1000, 4096 bytes
//   ├── buf @0x1000  1024  used
//   ├── buf @0x1400   512  idle   ← listed in the idle set as (512, 0x1400)
//   └── buf @0x1600  2560  used
//
// Allocation takes the smallest idle buf that fits (ties go to the lowest
// address) and splits off the remainder when it is at least ALIGN_SIZE.
// Freeing marks the buf idle and merges it with idle neighbours, so once
// everything is freed each block is a single idle buf again.
//
// Two sub-pools exist: persistent (parameters, long-lived state) and common
// (activations and temporaries).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use marten_core::error::{Error, Result};

/// Every size handed out is a multiple of this.
pub const ALIGN_SIZE: usize = 512;

/// First address handed out; zero is never a valid address.
const BASE_ADDR: usize = 0x1000;

/// Round `size` up to the allocation granularity. Zero still takes one unit.
pub fn align(size: usize) -> usize {
    if size == 0 {
        return ALIGN_SIZE;
    }
    size.div_ceil(ALIGN_SIZE) * ALIGN_SIZE
}

/// Snapshot of the pool's accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes held in blocks, used or idle.
    pub total_mem: usize,
    /// Bytes in used bufs.
    pub used_mem: usize,
    /// High-water mark of `used_mem`.
    pub peak_mem: usize,
    pub block_count: usize,
    pub idle_buf_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufStatus {
    Idle,
    Used,
}

#[derive(Debug, Clone, Copy)]
struct MemBuf {
    size: usize,
    status: BufStatus,
}

#[derive(Debug)]
struct MemBlock {
    size: usize,
    /// Bufs keyed by address, covering the block without gaps.
    bufs: BTreeMap<usize, MemBuf>,
}

/// One sub-pool: its blocks and the idle bufs ordered by (size, address).
#[derive(Debug, Default)]
struct MemManager {
    blocks: BTreeMap<usize, MemBlock>,
    idle: BTreeSet<(usize, usize)>,
    total_mem: usize,
    used_mem: usize,
}

impl MemManager {
    /// Base address of the block containing `addr`.
    fn block_of(&self, addr: usize) -> Option<usize> {
        let (&base, block) = self.blocks.range(..=addr).next_back()?;
        (addr < base + block.size).then_some(base)
    }

    /// Best-fit lookup; marks the chosen buf used and splits it.
    fn take_idle(&mut self, size: usize) -> Option<usize> {
        let &(buf_size, addr) = self.idle.range((size, 0)..).next()?;
        self.idle.remove(&(buf_size, addr));
        let base = self.block_of(addr)?;
        let block = self.blocks.get_mut(&base)?;
        let buf = block.bufs.get_mut(&addr)?;
        buf.status = BufStatus::Used;
        if buf_size - size >= ALIGN_SIZE {
            buf.size = size;
            let rest = (buf_size - size, addr + size);
            block.bufs.insert(
                rest.1,
                MemBuf {
                    size: rest.0,
                    status: BufStatus::Idle,
                },
            );
            self.idle.insert(rest);
        }
        let used = block.bufs[&addr].size;
        self.used_mem += used;
        Some(addr)
    }

    /// Register a fresh block and carve a used buf of `size` from its start.
    fn add_block(&mut self, base: usize, block_size: usize, size: usize) -> usize {
        let mut bufs = BTreeMap::new();
        let mut first = size;
        if block_size - size >= ALIGN_SIZE {
            bufs.insert(
                base + size,
                MemBuf {
                    size: block_size - size,
                    status: BufStatus::Idle,
                },
            );
            self.idle.insert((block_size - size, base + size));
        } else {
            first = block_size;
        }
        bufs.insert(
            base,
            MemBuf {
                size: first,
                status: BufStatus::Used,
            },
        );
        self.blocks.insert(
            base,
            MemBlock {
                size: block_size,
                bufs,
            },
        );
        self.total_mem += block_size;
        self.used_mem += first;
        base
    }

    /// Mark `addr` idle and merge it with idle neighbours.
    fn release(&mut self, base: usize, addr: usize) -> Result<()> {
        let block = self
            .blocks
            .get_mut(&base)
            .ok_or_else(|| Error::msg(format!("no memory block at {:#x}", base)))?;
        let mut buf = match block.bufs.get(&addr) {
            Some(b) if b.status == BufStatus::Used => *b,
            Some(_) => return Err(Error::msg(format!("double free of address {:#x}", addr))),
            None => return Err(Error::msg(format!("unknown address {:#x}", addr))),
        };
        self.used_mem -= buf.size;
        buf.status = BufStatus::Idle;

        // Absorb the next buf.
        let next = block
            .bufs
            .range(addr + 1..)
            .next()
            .map(|(&a, &b)| (a, b));
        if let Some((next_addr, next_buf)) = next {
            if next_buf.status == BufStatus::Idle {
                self.idle.remove(&(next_buf.size, next_addr));
                block.bufs.remove(&next_addr);
                buf.size += next_buf.size;
            }
        }

        // Fold into the previous buf.
        let prev = block.bufs.range(..addr).next_back().map(|(&a, &b)| (a, b));
        match prev {
            Some((prev_addr, prev_buf)) if prev_buf.status == BufStatus::Idle => {
                self.idle.remove(&(prev_buf.size, prev_addr));
                block.bufs.remove(&addr);
                let merged = prev_buf.size + buf.size;
                if let Some(p) = block.bufs.get_mut(&prev_addr) {
                    p.size = merged;
                }
                self.idle.insert((merged, prev_addr));
            }
            _ => {
                block.bufs.insert(addr, buf);
                self.idle.insert((buf.size, addr));
            }
        }
        Ok(())
    }

    /// Drop blocks that are a single idle buf; returns the bytes released.
    fn release_idle_blocks(&mut self) -> usize {
        let idle_blocks: Vec<(usize, usize)> = self
            .blocks
            .iter()
            .filter(|(_, b)| b.bufs.len() == 1 && b.bufs.values().all(|x| x.status == BufStatus::Idle))
            .map(|(&base, b)| (base, b.size))
            .collect();
        let mut released = 0;
        for (base, size) in idle_blocks {
            self.blocks.remove(&base);
            self.idle.remove(&(size, base));
            self.total_mem -= size;
            released += size;
        }
        released
    }
}

struct PoolState {
    persistent: MemManager,
    common: MemManager,
    free_budget: usize,
    unit_size: usize,
    next_addr: usize,
    peak_mem: usize,
}

impl PoolState {
    fn manager(&mut self, persistent: bool) -> &mut MemManager {
        if persistent {
            &mut self.persistent
        } else {
            &mut self.common
        }
    }

    fn used(&self) -> usize {
        self.persistent.used_mem + self.common.used_mem
    }

    fn note_peak(&mut self) {
        self.peak_mem = self.peak_mem.max(self.used());
    }

    /// Block size for a request: unit size doubled until it fits, capped at
    /// the free budget. `None` when the budget cannot hold the request.
    fn block_size_for(&self, size: usize) -> Option<usize> {
        if self.free_budget < size {
            return None;
        }
        let mut block = self.unit_size.max(ALIGN_SIZE);
        while block < size {
            block *= 2;
        }
        Some(block.min(self.free_budget))
    }

    fn add_block_and_buf(&mut self, size: usize, mut persistent: bool) -> Result<usize> {
        // The persistent pool gets one block; later persistent requests
        // spill into the common pool.
        if persistent && !self.persistent.blocks.is_empty() {
            if let Some(addr) = self.common.take_idle(size) {
                return Ok(addr);
            }
            persistent = false;
        }
        let block_size = match self.block_size_for(size) {
            Some(s) => s,
            None => {
                tracing::warn!(
                    requested = size,
                    free = self.free_budget,
                    "memory not enough, searching the other pool"
                );
                if let Some(addr) = self.manager(!persistent).take_idle(size) {
                    return Ok(addr);
                }
                return Err(Error::OutOfMemory {
                    requested: size,
                    available: self.free_budget,
                });
            }
        };
        let base = self.next_addr;
        self.next_addr += block_size;
        self.free_budget -= block_size;
        tracing::debug!(base, block_size, persistent, "new memory block");
        Ok(self.manager(persistent).add_block(base, block_size, size))
    }
}

/// Best-fit device memory pool.
///
/// ```ignore
/// let pool = DynamicMemPool::new(1 << 20, 64 << 10);
/// let a = pool.alloc(1000, false)?;     // aligned to 1024
/// pool.free(a)?;
/// assert_eq!(pool.stats()?.used_mem, 0);
/// ```
pub struct DynamicMemPool {
    state: Mutex<PoolState>,
    capacity: usize,
}

impl DynamicMemPool {
    /// A pool over `capacity` bytes whose blocks start at `unit_size` bytes.
    pub fn new(capacity: usize, unit_size: usize) -> Self {
        DynamicMemPool {
            state: Mutex::new(PoolState {
                persistent: MemManager::default(),
                common: MemManager::default(),
                free_budget: capacity,
                unit_size: align(unit_size),
                next_addr: BASE_ADDR,
                peak_mem: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PoolState>> {
        self.state
            .lock()
            .map_err(|_| Error::msg("memory pool lock poisoned"))
    }

    /// Allocate `size` bytes from the persistent or common pool.
    pub fn alloc(&self, size: usize, persistent: bool) -> Result<usize> {
        let aligned = align(size);
        let mut state = self.lock()?;
        let addr = match state.manager(persistent).take_idle(aligned) {
            Some(addr) => Ok(addr),
            None => state.add_block_and_buf(aligned, persistent),
        };
        match addr {
            Ok(addr) => {
                state.note_peak();
                Ok(addr)
            }
            Err(e) => {
                drop(state);
                self.dump_info();
                Err(e)
            }
        }
    }

    /// One allocation of `total` bytes split into consecutive addresses of
    /// `sizes`. The last address absorbs whatever `sizes` leave over.
    pub fn alloc_continuous(&self, total: usize, sizes: &[usize]) -> Result<Vec<usize>> {
        if sizes.is_empty() {
            return Err(Error::msg("alloc_continuous: empty size list"));
        }
        if sizes.contains(&0) {
            return Err(Error::msg("alloc_continuous: zero-sized entry"));
        }
        let requested: usize = sizes.iter().sum();
        if requested > total {
            return Err(Error::msg(format!(
                "alloc_continuous: sizes sum to {} which exceeds total {}",
                requested, total
            )));
        }
        let addr = self.alloc(total, false)?;
        let mut guard = self.lock()?;
        let state = &mut *guard;
        // A full common pool may have served the request from the persistent one.
        let mgr = if state.common.block_of(addr).is_some() {
            &mut state.common
        } else {
            &mut state.persistent
        };
        let base = mgr
            .block_of(addr)
            .ok_or_else(|| Error::msg(format!("unknown address {:#x}", addr)))?;
        let block = mgr
            .blocks
            .get_mut(&base)
            .ok_or_else(|| Error::msg(format!("no memory block at {:#x}", base)))?;
        let whole = block
            .bufs
            .remove(&addr)
            .ok_or_else(|| Error::msg(format!("unknown address {:#x}", addr)))?;

        let mut addrs = Vec::with_capacity(sizes.len());
        let mut cursor = addr;
        for (i, &size) in sizes.iter().enumerate() {
            let size = if i + 1 == sizes.len() {
                whole.size - (cursor - addr)
            } else {
                size
            };
            block.bufs.insert(
                cursor,
                MemBuf {
                    size,
                    status: BufStatus::Used,
                },
            );
            addrs.push(cursor);
            cursor += size;
        }
        Ok(addrs)
    }

    /// Return `addr` to the pool. Unknown or already free addresses are errors.
    pub fn free(&self, addr: usize) -> Result<()> {
        let mut state = self.lock()?;
        for persistent in [false, true] {
            let mgr = state.manager(persistent);
            if let Some(base) = mgr.block_of(addr) {
                if mgr.blocks[&base].bufs.contains_key(&addr) {
                    return mgr.release(base, addr);
                }
            }
        }
        Err(Error::msg(format!("free of unknown address {:#x}", addr)))
    }

    /// Size of the buf at `addr`, if it is allocated.
    pub fn buf_size(&self, addr: usize) -> Result<Option<usize>> {
        let state = self.lock()?;
        for mgr in [&state.common, &state.persistent] {
            if let Some(base) = mgr.block_of(addr) {
                if let Some(buf) = mgr.blocks[&base].bufs.get(&addr) {
                    if buf.status == BufStatus::Used {
                        return Ok(Some(buf.size));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Give fully idle blocks back to the device budget.
    pub fn release_idle_blocks(&self) -> Result<usize> {
        let mut state = self.lock()?;
        let released = state.common.release_idle_blocks() + state.persistent.release_idle_blocks();
        state.free_budget += released;
        if released > 0 {
            tracing::debug!(released, "released idle memory blocks");
        }
        Ok(released)
    }

    pub fn stats(&self) -> Result<PoolStats> {
        let state = self.lock()?;
        let mgrs = [&state.common, &state.persistent];
        Ok(PoolStats {
            total_mem: mgrs.iter().map(|m| m.total_mem).sum(),
            used_mem: state.used(),
            peak_mem: state.peak_mem,
            block_count: mgrs.iter().map(|m| m.blocks.len()).sum(),
            idle_buf_count: mgrs.iter().map(|m| m.idle.len()).sum(),
        })
    }

    /// Bytes of the budget not yet claimed by any block.
    pub fn free_budget(&self) -> Result<usize> {
        Ok(self.lock()?.free_budget)
    }

    /// Log a per-block summary of both sub-pools.
    pub fn dump_info(&self) {
        let state = match self.lock() {
            Ok(s) => s,
            Err(_) => return,
        };
        for (name, mgr) in [("common", &state.common), ("persistent", &state.persistent)] {
            if mgr.blocks.is_empty() {
                continue;
            }
            for (i, (base, block)) in mgr.blocks.iter().enumerate() {
                let idle: usize = block
                    .bufs
                    .values()
                    .filter(|b| b.status == BufStatus::Idle)
                    .map(|b| b.size)
                    .sum();
                tracing::info!(pool = name, block = i, base = *base, size = block.size, idle, "memory block");
            }
            tracing::info!(
                pool = name,
                unit_size = state.unit_size,
                blocks = mgr.blocks.len(),
                total = mgr.total_mem,
                used = mgr.used_mem,
                idle = mgr.total_mem - mgr.used_mem,
                peak = state.peak_mem,
                "memory pool info"
            );
        }
    }

    /// Sum of used buf sizes, walked buf by buf.
    #[doc(hidden)]
    pub fn used_bytes_by_walk(&self) -> Result<usize> {
        let state = self.lock()?;
        Ok([&state.common, &state.persistent]
            .iter()
            .flat_map(|m| m.blocks.values())
            .flat_map(|b| b.bufs.values())
            .filter(|b| b.status == BufStatus::Used)
            .map(|b| b.size)
            .sum())
    }

    /// Whether every block is one idle buf.
    #[doc(hidden)]
    pub fn fully_coalesced(&self) -> Result<bool> {
        let state = self.lock()?;
        Ok([&state.common, &state.persistent]
            .iter()
            .flat_map(|m| m.blocks.values())
            .all(|b| b.bufs.len() == 1 && b.bufs.values().all(|x| x.status == BufStatus::Idle)))
    }
}

impl std::fmt::Debug for DynamicMemPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DynamicMemPool(capacity={})", self.capacity)
    }
}
