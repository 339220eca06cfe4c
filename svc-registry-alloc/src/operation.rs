use std::sync::Arc;

use tracing::error;

use crate::port::PortAllocator;
use crate::{Error, Result};

/// Two-phase batch of node-port changes owned by a single request.
///
/// `allocate`/`allocate_next` apply to the underlying allocator immediately
/// and are recorded so they can be undone; `release_deferred` is staged and
/// only applied at `commit`. Dropping an uncommitted operation rolls back
/// everything it allocated, which is what ties allocator state to the
/// request's success: commit after the object persists, or let the drop
/// undo the staging on any earlier exit.
///
/// A dry-run operation never touches the allocator; it only checks that the
/// requested ports would have been grantable.
pub struct PortAllocationOperation {
    allocator: Arc<dyn PortAllocator>,
    dry_run: bool,
    allocated: Vec<u16>,
    deferred_release: Vec<u16>,
    committed: bool,
}

impl PortAllocationOperation {
    pub fn start(allocator: Arc<dyn PortAllocator>, dry_run: bool) -> Self {
        PortAllocationOperation {
            allocator,
            dry_run,
            allocated: Vec::new(),
            deferred_release: Vec::new(),
            committed: false,
        }
    }

    /// Reserves a specific port.
    pub fn allocate(&mut self, port: u16) -> Result<()> {
        if self.dry_run {
            if !self.allocator.range().contains(port) {
                return Err(Error::PortNotInRange { port, range: self.allocator.range() });
            }
            if self.allocator.has(port) || self.allocated.contains(&port) {
                return Err(Error::PortAllocated { port });
            }
            self.allocated.push(port);
            return Ok(());
        }
        self.allocator.allocate(port)?;
        self.allocated.push(port);
        Ok(())
    }

    /// Reserves any free port.
    pub fn allocate_next(&mut self) -> Result<u16> {
        if self.dry_run {
            let range = self.allocator.range();
            for port in range.min..=range.max {
                if !self.allocator.has(port) && !self.allocated.contains(&port) {
                    self.allocated.push(port);
                    return Ok(port);
                }
            }
            return Err(Error::PortRangeFull { range });
        }
        let port = self.allocator.allocate_next()?;
        self.allocated.push(port);
        Ok(port)
    }

    /// Schedules a release that only takes effect at `commit`.
    pub fn release_deferred(&mut self, port: u16) {
        self.deferred_release.push(port);
    }

    /// Finalizes the batch: applies the deferred releases and disarms the
    /// rollback. Release failures are returned for logging; they are not
    /// fatal at this point.
    pub fn commit(&mut self) -> Vec<Error> {
        self.committed = true;
        if self.dry_run {
            return Vec::new();
        }
        let mut errors = Vec::new();
        for &port in &self.deferred_release {
            if let Err(e) = self.allocator.release(port) {
                errors.push(e);
            }
        }
        errors
    }
}

impl Drop for PortAllocationOperation {
    fn drop(&mut self) {
        if self.committed || self.dry_run {
            return;
        }
        for &port in &self.allocated {
            if let Err(e) = self.allocator.release(port) {
                error!(%e, port, "failed to roll back node port");
            }
        }
    }
}
