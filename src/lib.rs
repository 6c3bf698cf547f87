//! Host-side AHCI block-device driver.
//!
//! Talks to a SATA HBA over its memory-mapped register file, issues ATA
//! commands through per-port command slots and PRD scatter/gather tables,
//! and completes asynchronous disk requests on interrupt. Host primitives
//! (iomem mapping, DMA address translation, clock, IRQ routing) come in
//! through the [`Hal`] trait, PCI config space through [`PciService`], and
//! disk consumers through the [`DiskBus`] registry and its message types.

#![no_std]

extern crate alloc;

mod ahci;
mod ata;
mod bus;
mod error;
mod hal;
mod mmio;
mod pci;
mod types;

pub use ahci::{AhciConfig, AhciHba, AhciPort, probe_controllers};
pub use ata::AtaParams;
pub use bus::{
    CommitSink, DiskBus, DiskCompletion, DiskHandler, DiskParams, DiskRequest, DiskStatus,
    DmaDescriptor,
};
pub use error::AhciError;
pub use hal::Hal;
pub use pci::PciService;
