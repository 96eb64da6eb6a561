//! Sizing of the in-memory piece buffer.

use sysinfo::System;

use super::StorageError;

/// Buffered piece limit used when no memory budget is configured.
pub const UNBOUNDED_CAPACITY: usize = 1000;

/// Below this many buffered pieces the store flushes almost every commit.
const LOW_CAPACITY_WARNING: usize = 3;

/// Number of pieces that fit into what is left of a memory budget.
///
/// Only two thirds of the remaining budget is used, and every piece is
/// assumed to cost a third more than its size in allocator overhead.
///
/// # Errors
/// - `StorageError::InsufficientMemory` - Not even one piece fits
pub fn calculate_capacity(
    budget: Option<u64>,
    current_usage: u64,
    piece_size: u32,
) -> Result<usize, StorageError> {
    let Some(budget) = budget else {
        return Ok(UNBOUNDED_CAPACITY);
    };

    let available = budget.saturating_sub(current_usage);
    let usable = available as f64 * 0.667;
    let count = (usable / (piece_size as f64 * 1.333)).floor() as usize;

    if count < 1 {
        return Err(StorageError::InsufficientMemory {
            available,
            piece_size,
        });
    }

    Ok(count)
}

/// Resident memory of this process in bytes, or 0 if it cannot be sampled.
pub fn current_memory_usage() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };

    let mut system = System::new();
    if !system.refresh_process(pid) {
        return 0;
    }
    system.process(pid).map(|process| process.memory()).unwrap_or(0)
}

/// Capacity for the running process, sampling its current memory usage.
///
/// # Errors
/// - `StorageError::InsufficientMemory` - Not even one piece fits
pub fn piece_capacity(budget: Option<u64>, piece_size: u32) -> Result<usize, StorageError> {
    let usage = if budget.is_some() {
        current_memory_usage()
    } else {
        0
    };

    let capacity = calculate_capacity(budget, usage, piece_size)?;
    if capacity < LOW_CAPACITY_WARNING {
        tracing::warn!(
            "Memory is really low: only {} piece(s) of {} bytes can be buffered",
            capacity,
            piece_size
        );
    }
    tracing::debug!("Piece buffer capacity is {}", capacity);

    Ok(capacity)
}
