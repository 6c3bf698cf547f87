//! Disk-request and disk-commit message types, plus the registry that
//! binds handlers to disk numbers.

use alloc::{string::String, sync::Arc, vec::Vec};

use spin::Mutex;

/// One entry of a caller's scatter/gather list, relative to the caller's
/// declared physical region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDescriptor {
    pub byteoffset: u64,
    pub bytecount: u64,
}

impl DmaDescriptor {
    /// Total transfer length of a scatter/gather list.
    pub fn sum_length(dma: &[DmaDescriptor]) -> u64 {
        dma.iter().map(|d| d.bytecount).sum()
    }
}

/// Completion status reported on the commit bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStatus {
    Ok,
    Error,
}

/// Emitted once per finished request, echoing the caller's tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskCompletion {
    pub disknr: usize,
    pub usertag: u64,
    pub status: DiskStatus,
}

/// Sink for asynchronous completions, passed by reference into the IRQ
/// path.
pub trait CommitSink {
    fn commit(&mut self, completion: DiskCompletion);
}

/// Consumer-visible drive parameters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiskParams {
    pub sectors: u64,
    pub sector_size: u32,
    pub model: String,
}

/// A request addressed to a disk number.
///
/// Read and write carry a scatter/gather list whose offsets index into the
/// caller's physical region `[physoffset, physoffset + physsize)`.
/// `GetParams` is answered synchronously by mutating the message.
#[derive(Debug)]
pub enum DiskRequest {
    Read {
        disknr: usize,
        sector: u64,
        dma: Vec<DmaDescriptor>,
        physoffset: usize,
        physsize: u64,
        usertag: u64,
    },
    Write {
        disknr: usize,
        sector: u64,
        dma: Vec<DmaDescriptor>,
        physoffset: usize,
        physsize: u64,
        usertag: u64,
    },
    FlushCache {
        disknr: usize,
        usertag: u64,
    },
    GetParams {
        disknr: usize,
        params: DiskParams,
    },
}

impl DiskRequest {
    pub fn disknr(&self) -> usize {
        match *self {
            Self::Read { disknr, .. }
            | Self::Write { disknr, .. }
            | Self::FlushCache { disknr, .. }
            | Self::GetParams { disknr, .. } => disknr,
        }
    }
}

/// A disk-number-addressed request handler.
pub trait DiskHandler {
    /// Handle `req` if it is addressed to this disk. Returns the "handled"
    /// indicator: `false` when the request is for another disk or could
    /// not be accepted.
    fn receive(&mut self, req: &mut DiskRequest) -> bool;
}

/// Registry binding [`DiskHandler`]s to disk numbers in registration
/// order.
#[derive(Default)]
pub struct DiskBus {
    disks: Vec<Arc<Mutex<dyn DiskHandler + Send>>>,
}

impl DiskBus {
    pub fn new() -> Self {
        Self { disks: Vec::new() }
    }

    /// Number of registered disks; doubles as the next free disk number.
    pub fn count(&self) -> usize {
        self.disks.len()
    }

    pub fn add(&mut self, handler: Arc<Mutex<dyn DiskHandler + Send>>) {
        self.disks.push(handler);
    }

    /// Offer `req` to each registered handler until one takes it.
    pub fn send(&self, req: &mut DiskRequest) -> bool {
        for disk in &self.disks {
            if disk.lock().receive(req) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_length_adds_all_descriptors() {
        let dma = [
            DmaDescriptor { byteoffset: 0, bytecount: 2048 },
            DmaDescriptor { byteoffset: 2048, bytecount: 2048 },
            DmaDescriptor { byteoffset: 8192, bytecount: 512 },
        ];
        assert_eq!(DmaDescriptor::sum_length(&dma), 4608);
        assert_eq!(DmaDescriptor::sum_length(&[]), 0);
    }

    struct FixedDisk {
        disknr: usize,
        hits: usize,
    }

    impl DiskHandler for FixedDisk {
        fn receive(&mut self, req: &mut DiskRequest) -> bool {
            if req.disknr() != self.disknr {
                return false;
            }
            self.hits += 1;
            true
        }
    }

    #[test]
    fn bus_routes_by_disk_number() {
        let mut bus = DiskBus::new();
        assert_eq!(bus.count(), 0);

        let first: Arc<Mutex<FixedDisk>> = Arc::new(Mutex::new(FixedDisk { disknr: 0, hits: 0 }));
        let second: Arc<Mutex<FixedDisk>> = Arc::new(Mutex::new(FixedDisk { disknr: 1, hits: 0 }));
        bus.add(first.clone());
        bus.add(second.clone());
        assert_eq!(bus.count(), 2);

        let mut req = DiskRequest::FlushCache { disknr: 1, usertag: 9 };
        assert!(bus.send(&mut req));
        assert_eq!(first.lock().hits, 0);
        assert_eq!(second.lock().hits, 1);

        let mut stray = DiskRequest::FlushCache { disknr: 7, usertag: 9 };
        assert!(!bus.send(&mut stray));
    }
}
