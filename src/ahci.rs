use alloc::{alloc::alloc_zeroed, sync::Arc, vec::Vec};
use core::{alloc::Layout, marker::PhantomData, ptr::NonNull};

use log::{debug, error, info, warn};
use spin::Mutex;
use volatile::VolatilePtr;

use crate::{
    ata::{
        ATA_CMD_FLUSH, ATA_CMD_FLUSH_EXT, ATA_CMD_ID_ATA, ATA_CMD_READ, ATA_CMD_READ_EXT,
        ATA_CMD_SET_FEATURES, ATA_CMD_WRITE, ATA_CMD_WRITE_EXT, ATA_ID_CONFIG_COMPLETE,
        ATA_ID_WORDS, AtaParams, SATA_FIS_TYPE_REGISTER_H2D,
    },
    bus::{CommitSink, DiskBus, DiskCompletion, DiskHandler, DiskRequest, DiskStatus, DmaDescriptor},
    error::AhciError,
    hal::{Hal, TIMEOUT_MS, wait_until_timeout},
    mmio::{
        AhciMmio, AhciMmioVolatileFieldAccess, GenericHostControlVolatileFieldAccess, HighPorts,
        PortRegisters, PortRegistersVolatileFieldAccess, PxI,
    },
    pci::{
        PCI_CLASS_STORAGE, PCI_CMD_MEM_BUSMASTER, PCI_REG_ABAR, PCI_REG_COMMAND,
        PCI_SUBCLASS_SATA, PciService,
    },
    types::{
        AHCI_MAX_SLOTS, MAX_BYTES_PER_PRD, MAX_PRD_COUNT, ahci_cmd_hdr, ahci_cmd_list,
        ahci_cmd_tbl, ahci_cmd_tbl_list, ahci_cmd_tblVolatileFieldAccess, ahci_rx_fis, ahci_sg,
        cmd_hdr_opts, sata_fis_h2d,
    },
};

fn alloc<T: Sized>(align: usize) -> VolatilePtr<'static, T> {
    unsafe {
        VolatilePtr::new(NonNull::new_unchecked(
            alloc_zeroed(Layout::from_size_align(size_of::<T>(), align).unwrap()).cast(),
        ))
    }
}

/// One SATA port: its register block, command list / command tables /
/// received-FIS buffers, and the slot bookkeeping.
///
/// Slots are handed out round-robin. A slot belongs to the device from the
/// CI write until the controller clears the bit again; the IRQ path turns
/// each cleared bit into exactly one commit carrying the submitter's tag.
pub struct AhciPort<H> {
    regs: VolatilePtr<'static, PortRegisters>,
    disknr: usize,
    max_slots: u32,
    dmar: bool,

    cmd_list: VolatilePtr<'static, ahci_cmd_list>,
    cmd_tbls: VolatilePtr<'static, ahci_cmd_tbl_list>,
    #[allow(dead_code)]
    rx_fis: VolatilePtr<'static, ahci_rx_fis>,

    next_tag: u32,
    in_progress: u32,
    usertags: [u64; AHCI_MAX_SLOTS],
    params: AtaParams,

    _h: PhantomData<H>,
}

// SAFETY: the port exclusively owns its register block and DMA buffers;
// the wrapped pointers are only ever dereferenced through volatile access.
unsafe impl<H> Send for AhciPort<H> {}

impl<H: Hal> AhciPort<H> {
    fn new(regs: VolatilePtr<'static, PortRegisters>, disknr: usize, max_slots: u32, dmar: bool) -> Self {
        let cmd_list = alloc::<ahci_cmd_list>(1024);
        let cmd_tbls = alloc::<ahci_cmd_tbl_list>(1024);
        let rx_fis = alloc::<ahci_rx_fis>(4096);
        debug!(
            "disk {disknr}: cl {:p} ct {:p} fis {:p}",
            cmd_list.as_raw_ptr(),
            cmd_tbls.as_raw_ptr(),
            rx_fis.as_raw_ptr()
        );

        Self {
            regs,
            disknr,
            max_slots: max_slots.clamp(1, AHCI_MAX_SLOTS as u32),
            dmar,
            cmd_list,
            cmd_tbls,
            rx_fis,
            next_tag: 0,
            in_progress: 0,
            usertags: [!0; AHCI_MAX_SLOTS],
            params: AtaParams::default(),
            _h: PhantomData,
        }
    }

    /// Bus address of a driver-owned buffer. With an IOMMU assignment the
    /// device sees our addresses identity-mapped; otherwise the host
    /// translates. The high dword of every pointer pair stays zero, the
    /// driver does not use 64-bit addressing.
    fn to_bus_address(&self, va: usize) -> u32 {
        let pa = if self.dmar { va } else { H::virt_to_phys(va) };
        pa as u32
    }

    fn cmd_hdr(&self, tag: u32) -> VolatilePtr<'static, ahci_cmd_hdr> {
        unsafe { self.cmd_list.map(|l| l.cast::<ahci_cmd_hdr>().add(tag as usize)) }
    }

    fn cmd_tbl(&self, tag: u32) -> VolatilePtr<'static, ahci_cmd_tbl> {
        unsafe { self.cmd_tbls.map(|t| t.cast::<ahci_cmd_tbl>().add(tag as usize)) }
    }

    /// Build the command header and FIS for the slot the round-robin
    /// cursor points at. Fails with `BackpressureRequired` while that slot
    /// is still owned by the device, before anything is written.
    fn set_command(
        &mut self,
        command: u8,
        sector: u64,
        read: bool,
        count: u16,
        atapi: bool,
        pmp: u8,
        features: u16,
    ) -> Result<(), AhciError> {
        if self.in_progress & (1 << self.next_tag) != 0 {
            return Err(AhciError::BackpressureRequired);
        }

        let tbl = self.cmd_tbl(self.next_tag);
        let tbl_addr = self.to_bus_address(tbl.as_raw_ptr().addr().get());
        self.cmd_hdr(self.next_tag).write(ahci_cmd_hdr {
            opts: cmd_hdr_opts(read, atapi, pmp),
            prdbc: 0,
            tbl_addr_lo: tbl_addr,
            tbl_addr_hi: 0,
            reserved: [0; 4],
        });

        tbl.cfis().write(sata_fis_h2d {
            fis_type: SATA_FIS_TYPE_REGISTER_H2D,
            pm_port_c: 0x80 | (pmp & 0xF),
            command,
            features: features as u8,
            lba_low: sector as u8,
            lba_mid: (sector >> 8) as u8,
            lba_high: (sector >> 16) as u8,
            device: 0x40,
            lba_low_exp: (sector >> 24) as u8,
            lba_mid_exp: (sector >> 32) as u8,
            lba_high_exp: (sector >> 40) as u8,
            features_exp: (features >> 8) as u8,
            sector_count: count as u8,
            sector_count_exp: (count >> 8) as u8,
            ..Default::default()
        });
        Ok(())
    }

    /// Append one PRD entry to the command under construction.
    fn add_prd(&mut self, buffer: usize, count: u64) -> Result<(), AhciError> {
        if count == 0 || count & 1 != 0 || count >= MAX_BYTES_PER_PRD {
            return Err(AhciError::InvalidArgument);
        }

        let hdr = self.cmd_hdr(self.next_tag);
        let prd = (hdr.read().opts >> 16) as usize;
        if prd >= MAX_PRD_COUNT {
            return Err(AhciError::InvalidArgument);
        }
        hdr.update(|mut h| {
            h.opts += 1 << 16;
            h
        });

        let sg = unsafe { self.cmd_tbl(self.next_tag).sgs().map(|s| s.cast::<ahci_sg>().add(prd)) };
        sg.write(ahci_sg {
            addr_lo: self.to_bus_address(buffer),
            addr_hi: 0,
            reserved: 0,
            // the controller reads this as byte count minus one
            flags_size: (count - 1) as u32,
        });
        Ok(())
    }

    /// Hand the current slot to the device and advance the cursor.
    /// Returns the slot that was issued.
    fn start_command(&mut self, usertag: u64) -> u32 {
        let tag = self.next_tag;
        self.in_progress |= 1 << tag;
        self.usertags[tag as usize] = usertag;

        // the device must observe the table before the doorbell
        H::flush_dcache();
        self.regs.CI().write(1 << tag);

        self.next_tag = (tag + 1) % self.max_slots;
        tag
    }

    fn identify_drive(&mut self, buffer: &mut [u16; ATA_ID_WORDS]) -> Result<(), AhciError> {
        buffer.fill(0);
        self.set_command(ATA_CMD_ID_ATA, 0, true, 0, false, 0, 0)?;
        self.add_prd(buffer.as_mut_ptr().addr(), 512)?;
        let tag = self.start_command(0);

        // PIO data-in, completes without an IRQ worth waiting for
        let regs = self.regs;
        if !wait_until_timeout::<H>(|| regs.CI().read() & (1 << tag) == 0, TIMEOUT_MS) {
            return Err(AhciError::DeviceUnresponsive);
        }
        self.in_progress &= !(1 << tag);
        self.usertags[tag as usize] = !0;

        // no power-up-in-standby handling
        if buffer[2] != ATA_ID_CONFIG_COMPLETE {
            return Err(AhciError::UnsupportedDrive);
        }
        self.params = AtaParams::from_identify(buffer);
        info!(
            "disk {}: {} ({} sectors{})",
            self.disknr,
            self.params.model,
            self.params.sectors,
            if self.params.lba48 { ", lba48" } else { "" }
        );
        Ok(())
    }

    /// Issue SET FEATURES and wait for it synchronously, like IDENTIFY.
    pub fn set_features(&mut self, features: u16, count: u16) -> Result<(), AhciError> {
        self.set_command(ATA_CMD_SET_FEATURES, 0, false, count, false, 0, features)?;
        let tag = self.start_command(0);

        let regs = self.regs;
        if !wait_until_timeout::<H>(|| regs.CI().read() & (1 << tag) == 0, TIMEOUT_MS) {
            return Err(AhciError::DeviceUnresponsive);
        }
        self.in_progress &= !(1 << tag);
        self.usertags[tag as usize] = !0;
        Ok(())
    }

    /// Bring the port from unknown state to ready: stop the engines,
    /// install the command list and FIS buffers, restart, then IDENTIFY
    /// the drive into `buffer`.
    pub fn init(&mut self, buffer: &mut [u16; ATA_ID_WORDS]) -> Result<(), AhciError> {
        let regs = self.regs;

        if regs.CMD().read().engine_active() {
            // stop processing and wait for the command list runner
            regs.CMD().update(|c| c.with_ST(false));
            if !wait_until_timeout::<H>(|| !regs.CMD().read().CR(), TIMEOUT_MS) {
                return Err(AhciError::DeviceUnresponsive);
            }

            // stop FIS reception
            regs.CMD().update(|c| c.with_FRE(false));
            if !wait_until_timeout::<H>(|| !regs.CMD().read().FR(), TIMEOUT_MS) {
                return Err(AhciError::DeviceUnresponsive);
            }
        }

        // install command list and received-FIS pointers
        regs.CLB().write(self.to_bus_address(self.cmd_list.as_raw_ptr().addr().get()));
        regs.CLBU().write(0);
        regs.FB().write(self.to_bus_address(self.rx_fis.as_raw_ptr().addr().get()));
        regs.FBU().write(0);

        // clear error and interrupt status
        regs.SERR().write(!0);
        regs.IS().write(PxI::from_bits(!0));

        // FIS reception back on; command processing must still be off
        regs.CMD().update(|c| c.with_FRE(true));
        if !wait_until_timeout::<H>(|| !regs.CMD().read().CR(), TIMEOUT_MS) {
            return Err(AhciError::DeviceUnresponsive);
        }

        // command list override, then start
        regs.CMD().update(|c| c.with_CLO(true));
        if !wait_until_timeout::<H>(|| !regs.CMD().read().CLO(), TIMEOUT_MS) {
            return Err(AhciError::DeviceUnresponsive);
        }
        regs.CMD().update(|c| c.with_ST(true));

        self.in_progress = 0;
        self.usertags = [!0; AHCI_MAX_SLOTS];

        regs.IE().write(PxI::irq_sources());

        self.identify_drive(buffer)
    }

    /// Interrupt service: acknowledge, commit every slot the controller
    /// has finished, and recover from task-file errors.
    pub fn irq(&mut self, commit: &mut dyn CommitSink) {
        let regs = self.regs;
        let is = regs.IS().read();
        regs.IS().write(is);

        let mut done = self.in_progress & !regs.CI().read();
        while done != 0 {
            let tag = done.trailing_zeros() as usize;
            commit.commit(DiskCompletion {
                disknr: self.disknr,
                usertag: self.usertags[tag],
                status: DiskStatus::Ok,
            });
            self.usertags[tag] = !0;
            self.in_progress &= !(1 << tag);
            done &= !(1 << tag);
        }

        if regs.TFD().read().STS_ERR() {
            warn!(
                "disk {}: command failed with {:?}",
                self.disknr,
                regs.TFD().read()
            );

            // fail whatever was still in flight, then recover the port
            let mut abandoned = self.in_progress;
            while abandoned != 0 {
                let tag = abandoned.trailing_zeros() as usize;
                commit.commit(DiskCompletion {
                    disknr: self.disknr,
                    usertag: self.usertags[tag],
                    status: DiskStatus::Error,
                });
                self.usertags[tag] = !0;
                abandoned &= !(1 << tag);
            }
            self.in_progress = 0;

            let mut buffer = [0u16; ATA_ID_WORDS];
            if let Err(e) = self.init(&mut buffer) {
                error!("disk {}: reinit after device error failed: {e}", self.disknr);
            }
        }
    }

    fn read_write(
        &mut self,
        sector: u64,
        dma: &[DmaDescriptor],
        physoffset: usize,
        physsize: u64,
        usertag: u64,
        read: bool,
    ) -> Result<(), AhciError> {
        let length = DmaDescriptor::sum_length(dma);
        if length & 0x1FF != 0 {
            return Err(AhciError::InvalidArgument);
        }

        let command = match (read, self.params.lba48) {
            (true, true) => ATA_CMD_READ_EXT,
            (true, false) => ATA_CMD_READ,
            (false, true) => ATA_CMD_WRITE_EXT,
            (false, false) => ATA_CMD_WRITE,
        };
        self.set_command(command, sector, read, (length >> 9) as u16, false, 0, 0)?;

        for d in dma {
            if d.byteoffset > physsize || d.byteoffset + d.bytecount > physsize {
                return Err(AhciError::InvalidArgument);
            }
            self.add_prd(physoffset + d.byteoffset as usize, d.bytecount)?;
        }
        self.start_command(usertag);
        Ok(())
    }

    fn flush_cache(&mut self, usertag: u64) -> Result<(), AhciError> {
        let command = if self.params.lba48 { ATA_CMD_FLUSH_EXT } else { ATA_CMD_FLUSH };
        // no payload, the direction flag is immaterial
        self.set_command(command, 0, true, 0, false, 0, 0)?;
        self.start_command(usertag);
        Ok(())
    }

    /// Log the port's live register state.
    pub fn debug(&self) {
        let regs = self.regs;
        debug!(
            "disk {}: is {:?} ci {:#x} ie {:?} cmd {:?} tfd {:?}",
            self.disknr,
            regs.IS().read(),
            regs.CI().read(),
            regs.IE().read(),
            regs.CMD().read(),
            regs.TFD().read()
        );
    }
}

impl<H: Hal> DiskHandler for AhciPort<H> {
    fn receive(&mut self, req: &mut DiskRequest) -> bool {
        if req.disknr() != self.disknr {
            return false;
        }

        let res = match req {
            DiskRequest::Read { sector, dma, physoffset, physsize, usertag, .. } => {
                self.read_write(*sector, dma, *physoffset, *physsize, *usertag, true)
            }
            DiskRequest::Write { sector, dma, physoffset, physsize, usertag, .. } => {
                self.read_write(*sector, dma, *physoffset, *physsize, *usertag, false)
            }
            DiskRequest::FlushCache { usertag, .. } => self.flush_cache(*usertag),
            DiskRequest::GetParams { params, .. } => {
                self.params.fill_disk_params(params);
                Ok(())
            }
        };

        match res {
            Ok(()) => true,
            Err(e) => {
                warn!("disk {}: request rejected: {e}", self.disknr);
                false
            }
        }
    }
}

/// Runtime configuration, from the command line.
#[derive(Debug, Clone, Copy)]
pub struct AhciConfig {
    /// Bit *i* claims the *i*-th matching controller.
    pub controller_mask: u32,
    /// GSI to fall back to when MSI is unavailable and the platform has no
    /// routing entry.
    pub fallback_gsi: u8,
}

impl Default for AhciConfig {
    fn default() -> Self {
        Self { controller_mask: !0, fallback_gsi: 0x13 }
    }
}

/// The HBA: global registers, the implemented ports, and the IRQ demux.
pub struct AhciHba<H: Hal> {
    regs: VolatilePtr<'static, AhciMmio>,
    regs_high: Option<VolatilePtr<'static, HighPorts>>,
    ports: [Option<Arc<Mutex<AhciPort<H>>>>; 32],
    bdf: u32,
    hostirq: u32,
}

// SAFETY: the HBA exclusively owns its register window; access is volatile
// only.
unsafe impl<H: Hal> Send for AhciHba<H> {}

impl<H: Hal> AhciHba<H> {
    /// Map the controller's ABAR, enable AHCI mode, bring up every
    /// implemented port and register it with the disk bus.
    pub fn attach(
        pci: &mut dyn PciService,
        disk_bus: &mut DiskBus,
        bdf: u32,
        hostirq: u32,
        dmar: bool,
    ) -> Result<Self, AhciError> {
        // we need mem-decode and busmaster dma
        if pci.conf_read(bdf, PCI_REG_COMMAND) & PCI_CMD_MEM_BUSMASTER != PCI_CMD_MEM_BUSMASTER {
            return Err(AhciError::PciMisconfigured);
        }
        // and a 32bit memory bar
        let bar = pci.conf_read(bdf, PCI_REG_ABAR);
        if bar & 0x7 != 0 {
            return Err(AhciError::PciMisconfigured);
        }

        let ptr = H::alloc_iomem(bar.into(), 0x1000).ok_or(AhciError::MappingFailed)?;
        let regs = unsafe { VolatilePtr::new(ptr.cast::<AhciMmio>()) };
        let host = regs.host();

        // ports 30 and 31 live past the first 4k of register space
        let pi = host.pi().read();
        let regs_high = if pi >> 30 != 0 {
            let ptr = H::alloc_iomem(u64::from(bar) + 0x1000, 0x1000).ok_or(AhciError::MappingFailed)?;
            Some(unsafe { VolatilePtr::new(ptr.cast::<HighPorts>()) })
        } else {
            None
        };

        host.ghc().update(|ghc| ghc.with_AE(true));
        info!(
            "AHCI: cap {:?} cap2 {:#x} global {:?} ports {pi:#x} version {} bohc {:#x}",
            host.cap().read(),
            host.cap2().read(),
            host.ghc().read(),
            host.vs().read(),
            host.bohc().read()
        );
        if host.bohc().read() != 0 {
            return Err(AhciError::BiosOwnershipBusy);
        }

        let mut hba = Self {
            regs,
            regs_high,
            ports: core::array::from_fn(|_| None),
            bdf,
            hostirq,
        };

        let max_slots = u32::from(host.cap().read().NCS()) + 1;
        for nr in 0..30 {
            let pregs = unsafe { regs.ports().map(|p| p.cast::<PortRegisters>().add(nr)) };
            hba.create_port(nr, pregs, disk_bus, max_slots, dmar);
        }
        if let Some(high) = hba.regs_high {
            for nr in 30..32 {
                let pregs = unsafe { high.map(|p| p.cast::<PortRegisters>().add(nr - 30)) };
                hba.create_port(nr, pregs, disk_bus, max_slots, dmar);
            }
        }

        // clear pending interrupts, then let the controller raise new ones
        host.is().write(pi);
        host.ghc().update(|ghc| ghc.with_IE(true));
        Ok(hba)
    }

    fn create_port(
        &mut self,
        nr: usize,
        pregs: VolatilePtr<'static, PortRegisters>,
        disk_bus: &mut DiskBus,
        max_slots: u32,
        dmar: bool,
    ) {
        // port implemented and something answered the signature?
        let sig = pregs.SIG().read();
        if self.regs.host().pi().read() & (1 << nr) == 0 || sig == !0 {
            return;
        }
        info!("PORT {nr:#x} sig {sig:#x}");

        let mut port = AhciPort::<H>::new(pregs, disk_bus.count(), max_slots, dmar);
        let mut buffer = [0u16; ATA_ID_WORDS];
        match port.init(&mut buffer) {
            Ok(()) => {
                let port = Arc::new(Mutex::new(port));
                disk_bus.add(port.clone());
                self.ports[nr] = Some(port);
            }
            Err(e) => warn!("AHCI: port {nr:#x} init failed: {e}"),
        }
    }

    /// Demultiplex one controller interrupt: dispatch every port whose
    /// status bit is set, then acknowledge what was read.
    pub fn handle_irq(&mut self, line: u32, commit: &mut dyn CommitSink) -> bool {
        if line != self.hostirq {
            return false;
        }

        let host = self.regs.host();
        let oldis = host.is().read();
        let mut is = oldis;
        while is != 0 {
            let nr = is.trailing_zeros() as usize;
            if let Some(port) = &self.ports[nr] {
                port.lock().irq(commit);
            }
            is &= !(1 << nr);
        }
        host.is().write(oldis);
        true
    }

    pub fn bdf(&self) -> u32 {
        self.bdf
    }
}

/// Claim every AHCI controller on the PCI bus the mask selects: assign it
/// to the IOMMU when available, resolve its interrupt (MSI preferred),
/// attach it and register its drives.
pub fn probe_controllers<H: Hal>(
    pci: &mut dyn PciService,
    disk_bus: &mut DiskBus,
    config: &AhciConfig,
) -> Result<Vec<AhciHba<H>>, AhciError> {
    let mut hbas = Vec::new();
    for num in 0u32.. {
        let Some(bdf) = pci.search_device(PCI_CLASS_STORAGE, PCI_SUBCLASS_SATA, num) else {
            break;
        };
        if num >= 32 || config.controller_mask >> num & 1 == 0 {
            info!("Ignore AHCI controller #{num} at {bdf:#x}");
            continue;
        }

        let dmar = H::assign_pci_device(bdf);
        let gsi = pci.get_gsi(bdf, config.fallback_gsi);
        let hba = AhciHba::<H>::attach(pci, disk_bus, bdf, gsi, dmar)?;
        info!("DISK controller #{num} AHCI {bdf:#x} id {:#x}", pci.conf_read(bdf, 0));

        if !pci.enable_msi(bdf, gsi) {
            warn!("MSI not enabled, falling back to GSI {gsi:#x}");
        }
        if !H::attach_irq(gsi) {
            return Err(AhciError::IrqAttachFailed);
        }
        hbas.push(hba);
    }
    Ok(hbas)
}
