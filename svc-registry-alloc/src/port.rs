use std::fmt;
use std::sync::Mutex;

use crate::bitmap::Bitmap;
use crate::{Error, Result};

/// Inclusive node-port range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        assert!(min <= max, "port range min must not exceed max");
        PortRange { min, max }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }

    pub fn size(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange::new(30000, 32767)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Capability surface for a node-port allocator.
pub trait PortAllocator: Send + Sync {
    fn allocate(&self, port: u16) -> Result<()>;
    fn allocate_next(&self) -> Result<u16>;

    /// Releasing an unreserved or out-of-range port is not an error.
    fn release(&self, port: u16) -> Result<()>;

    fn has(&self, port: u16) -> bool;
    fn range(&self) -> PortRange;
}

/// Bitmap-backed allocator over a [`PortRange`].
pub struct PortRangeAllocator {
    range: PortRange,
    inner: Mutex<Bitmap>,
}

impl PortRangeAllocator {
    pub fn new(range: PortRange) -> Self {
        PortRangeAllocator {
            range,
            inner: Mutex::new(Bitmap::new(range.size())),
        }
    }

    pub fn allocated_count(&self) -> usize {
        self.inner.lock().expect("allocator mutex poisoned").allocated()
    }

    fn offset_of(&self, port: u16) -> Option<usize> {
        self.range.contains(port).then(|| usize::from(port - self.range.min))
    }
}

impl PortAllocator for PortRangeAllocator {
    fn allocate(&self, port: u16) -> Result<()> {
        let offset = self
            .offset_of(port)
            .ok_or(Error::PortNotInRange { port, range: self.range })?;
        let mut bitmap = self.inner.lock().expect("allocator mutex poisoned");
        if !bitmap.allocate(offset) {
            return Err(Error::PortAllocated { port });
        }
        Ok(())
    }

    fn allocate_next(&self) -> Result<u16> {
        let mut bitmap = self.inner.lock().expect("allocator mutex poisoned");
        let offset = bitmap
            .allocate_next()
            .ok_or(Error::PortRangeFull { range: self.range })?;
        Ok(self.range.min + offset as u16)
    }

    fn release(&self, port: u16) -> Result<()> {
        let Some(offset) = self.offset_of(port) else {
            return Ok(());
        };
        self.inner
            .lock()
            .expect("allocator mutex poisoned")
            .release(offset);
        Ok(())
    }

    fn has(&self, port: u16) -> bool {
        match self.offset_of(port) {
            Some(offset) => self.inner.lock().expect("allocator mutex poisoned").has(offset),
            None => false,
        }
    }

    fn range(&self) -> PortRange {
        self.range
    }
}
