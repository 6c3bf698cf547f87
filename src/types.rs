#![allow(non_camel_case_types)]

use volatile::VolatileFieldAccess;

/// Command slots per port; hardware exposes `CAP.NCS + 1` of them.
pub const AHCI_MAX_SLOTS: usize = 32;

/// PRD entries per command table.
pub const MAX_PRD_COUNT: usize = 64;

/// A single PRD moves less than 4 MiB.
pub const MAX_BYTES_PER_PRD: u64 = 1 << 22;

/// Command header, one per slot, 8 dwords.
///
/// `opts` packs the CFIS dword length (bits 4:0), the ATAPI and write
/// flags (bits 5, 6), the port-multiplier port (bits 15:12) and the PRD
/// table length (bits 31:16).
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct ahci_cmd_hdr {
    pub opts: u32,
    pub prdbc: u32,
    pub tbl_addr_lo: u32,
    pub tbl_addr_hi: u32,
    pub reserved: [u32; 4],
}

/// Base `opts` value for a command: a 20-byte Register H2D FIS plus the
/// direction/ATAPI/PMP flags. The PRD count field starts at zero.
pub const fn cmd_hdr_opts(read: bool, atapi: bool, pmp: u8) -> u32 {
    let cfl = (size_of::<sata_fis_h2d>() / 4) as u32;
    cfl | if atapi { 0x20 } else { 0 } | if read { 0 } else { 0x40 } | ((pmp as u32 & 0xF) << 12)
}

pub type ahci_cmd_list = [ahci_cmd_hdr; AHCI_MAX_SLOTS];

pub type ahci_rx_fis = [u8; 256];

/// One PRD (scatter/gather) entry. `flags_size` holds the byte count
/// minus one in its low 22 bits.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct ahci_sg {
    pub addr_lo: u32,
    pub addr_hi: u32,
    pub reserved: u32,
    pub flags_size: u32,
}

/// Register Host-to-Device FIS.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct sata_fis_h2d {
    pub fis_type: u8,
    pub pm_port_c: u8,
    pub command: u8,
    pub features: u8,
    pub lba_low: u8,
    pub lba_mid: u8,
    pub lba_high: u8,
    pub device: u8,
    pub lba_low_exp: u8,
    pub lba_mid_exp: u8,
    pub lba_high_exp: u8,
    pub features_exp: u8,
    pub sector_count: u8,
    pub sector_count_exp: u8,
    pub res1: u8,
    pub control: u8,
    pub res2: [u8; 4],
}

/// Per-slot command table: the command FIS region (64 bytes, of which the
/// H2D frame uses 20), the ATAPI command region (unused here), and the PRD
/// table at offset 0x80.
#[derive(Clone, Copy, VolatileFieldAccess)]
#[repr(C)]
pub struct ahci_cmd_tbl {
    pub cfis: sata_fis_h2d,
    _res: [u8; 0x6C],
    pub sgs: [ahci_sg; MAX_PRD_COUNT],
}

/// One table per slot, so commands in different slots never share PRD
/// storage.
pub type ahci_cmd_tbl_list = [ahci_cmd_tbl; AHCI_MAX_SLOTS];

const _: () = assert!(size_of::<ahci_cmd_hdr>() == 32);
const _: () = assert!(size_of::<ahci_cmd_list>() == 1024);
const _: () = assert!(size_of::<ahci_sg>() == 16);
const _: () = assert!(size_of::<sata_fis_h2d>() == 20);
const _: () = assert!(core::mem::offset_of!(ahci_cmd_tbl, sgs) == 0x80);
const _: () = assert!(size_of::<ahci_cmd_tbl>() == 128 + MAX_PRD_COUNT * 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_opts_encoding() {
        // CFL is always 5 dwords for a Register H2D FIS.
        assert_eq!(cmd_hdr_opts(true, false, 0), 5);
        // Bit 6 is the write flag.
        assert_eq!(cmd_hdr_opts(false, false, 0), 5 | 0x40);
        // Bit 5 is the ATAPI flag, bits 15:12 the PMP.
        assert_eq!(cmd_hdr_opts(true, true, 3), 5 | 0x20 | 0x3000);
        // PMP is four bits wide.
        assert_eq!(cmd_hdr_opts(true, false, 0x1F), 5 | 0xF000);
    }

    #[test]
    fn table_area_matches_slot_stride() {
        assert_eq!(size_of::<ahci_cmd_tbl>(), 1152);
        assert_eq!(size_of::<ahci_cmd_tbl_list>(), AHCI_MAX_SLOTS * 1152);
    }
}
