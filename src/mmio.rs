#![allow(non_snake_case, clippy::upper_case_acronyms)]

use core::fmt;

use bitfield_struct::bitfield;
use volatile::{VolatileFieldAccess, access::ReadOnly};

/// The HBA's 0x1000-byte register window: generic host control plus the
/// port blocks that fit in it (ports 0..30). Ports 30 and 31, when
/// implemented, live in a separately mapped [`HighPorts`] window.
#[derive(VolatileFieldAccess)]
#[repr(C)]
pub struct AhciMmio {
    pub host: GenericHostControl,
    _res: [u8; 0xD4],
    pub ports: [PortRegisters; 30],
}

/// Register block for the ports above the first window (30 and 31),
/// mapped at ABAR + 0x1000.
pub type HighPorts = [PortRegisters; 2];

const _: () = assert!(core::mem::offset_of!(AhciMmio, ports) == 0x100);
const _: () = assert!(size_of::<AhciMmio>() == 0x1000);

#[derive(VolatileFieldAccess)]
#[repr(C)]
pub struct GenericHostControl {
    /// CAP – HBA capabilities.
    #[access(ReadOnly)]
    pub cap: CAP,
    /// GHC – global HBA control.
    pub ghc: GHC,
    /// IS – one pending-interrupt bit per port; write 1 to clear.
    pub is: u32,
    /// PI – ports implemented, loaded by the BIOS.
    pub pi: u32,
    /// VS – AHCI version.
    #[access(ReadOnly)]
    pub vs: VS,
    /// CCC_CTL / CCC_PORTS – command completion coalescing, unused.
    pub ccc_ctl: u32,
    pub ccc_ports: u32,
    /// EM_LOC / EM_CTL – enclosure management, unused.
    pub em_loc: u32,
    pub em_ctl: u32,
    /// CAP2 – extended capabilities.
    #[access(ReadOnly)]
    pub cap2: u32,
    /// BOHC – BIOS/OS handoff control; non-zero means the handoff has not
    /// completed.
    pub bohc: u32,
}

const _: () = assert!(core::mem::offset_of!(GenericHostControl, bohc) == 0x28);

/// CAP – HBA capabilities.
#[bitfield(u32, order = Msb)]
pub struct CAP {
    /// 64-bit addressing supported.
    pub S64A: bool,
    /// Native command queuing supported.
    pub SNCQ: bool,
    /// SNotification register supported.
    pub SSNTF: bool,
    /// Mechanical presence switches supported.
    pub SMPS: bool,
    /// Staggered spin-up supported.
    pub SSS: bool,
    /// Aggressive link power management supported.
    pub SALP: bool,
    /// Activity LED supported.
    pub SAL: bool,
    /// Command list override supported.
    pub SCLO: bool,
    /// Interface speed support, same encoding as PxSCTL.DET.SPD.
    #[bits(4)]
    pub ISS: u8,
    pub __: bool,
    /// AHCI-only controller, no legacy task-file interface.
    pub SAM: bool,
    /// Port multiplier supported.
    pub SPM: bool,
    /// FIS-based switching supported.
    pub FBSS: bool,
    /// Multiple DRQ blocks per PIO command supported.
    pub PMD: bool,
    /// Slumber state capable.
    pub SSC: bool,
    /// Partial state capable.
    pub PSC: bool,
    /// Command slots per port, 0's-based.
    #[bits(5)]
    pub NCS: u8,
    /// Command completion coalescing supported.
    pub CCCS: bool,
    /// Enclosure management supported.
    pub EMS: bool,
    /// External SATA ports present.
    pub SXS: bool,
    /// Ports supported by the silicon, 0's-based.
    #[bits(5)]
    pub NP: u8,
}

/// GHC – global HBA control.
#[bitfield(u32, order = Msb)]
pub struct GHC {
    /// AHCI enable. Must be set before any other AHCI register access.
    pub AE: bool,
    #[bits(28)]
    __: u32,
    /// MSI reverted to single message (set by hardware).
    pub MRSM: bool,
    /// Global interrupt enable.
    pub IE: bool,
    /// HBA reset; cleared by hardware when the reset completes.
    pub HR: bool,
}

/// VS – AHCI version, BCD major.minor.
#[bitfield(u32, order = Msb)]
pub struct VS {
    major_h: u8,
    major_l: u8,
    minor_h: u8,
    minor_l: u8,
}

impl fmt::Display for VS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let major = self.major_h() * 0x10 + self.major_l();
        let minor = self.minor_h() * 0x10 + self.minor_l();
        write!(f, "{major:x}.{minor:x}")
    }
}

/// One port's register block, 0x80 bytes.
#[derive(VolatileFieldAccess)]
#[repr(C)]
pub struct PortRegisters {
    /// Command list base address (1024-byte aligned).
    pub CLB: u32,
    pub CLBU: u32,
    /// Received-FIS base address (256-byte aligned).
    pub FB: u32,
    pub FBU: u32,
    /// Interrupt status; write 1 to clear.
    pub IS: PxI,
    /// Interrupt enable, same bit layout as IS.
    pub IE: PxI,
    /// Command and status.
    pub CMD: PxCMD,
    _res0: u32,
    /// Task file data; bit 0 is the ATA ERR bit.
    #[access(ReadOnly)]
    pub TFD: PxTFD,
    /// Device signature; all-ones when nothing responded.
    #[access(ReadOnly)]
    pub SIG: u32,
    /// SStatus / SControl / SError / SActive.
    pub SSTS: u32,
    pub SCTL: u32,
    pub SERR: u32,
    pub SACT: u32,
    /// Command issue: writing a bit starts that slot, the device clears it
    /// on completion.
    pub CI: u32,
    pub SNTF: u32,
    pub FBS: u32,
    _res1: [u8; 0x2C],
    _vendor: [u32; 4],
}

const _: () = assert!(size_of::<PortRegisters>() == 0x80);

/// Port interrupt status/enable bits.
#[bitfield(u32, order = Msb)]
pub struct PxI {
    /// Cold port detect.
    pub CPD: bool,
    /// Task file error.
    pub TFE: bool,
    /// Host bus fatal error.
    pub HBF: bool,
    /// Host bus data error.
    pub HBD: bool,
    /// Interface fatal error.
    pub IF: bool,
    /// Interface non-fatal error.
    pub INF: bool,
    __: bool,
    /// Overflow.
    pub OF: bool,
    /// Incorrect port multiplier.
    pub IPM: bool,
    /// PhyRdy change.
    pub PRC: bool,
    #[bits(14)]
    __: u16,
    /// Device mechanical presence.
    pub DMP: bool,
    /// Port connect change.
    pub PC: bool,
    /// Descriptor processed.
    pub DP: bool,
    /// Unknown FIS.
    pub UF: bool,
    /// Set device bits FIS received.
    pub SDB: bool,
    /// DMA setup FIS received.
    pub DS: bool,
    /// PIO setup FIS received.
    pub PS: bool,
    /// Device-to-host register FIS received.
    pub DHR: bool,
}

impl PxI {
    /// The interrupt sources the driver arms on every port: the FIS
    /// arrival events plus all error sources.
    pub const fn irq_sources() -> Self {
        Self::new()
            .with_DHR(true)
            .with_UF(true)
            .with_DP(true)
            .with_PC(true)
            .with_DMP(true)
            .with_IPM(true)
            .with_OF(true)
            .with_IF(true)
            .with_HBD(true)
            .with_HBF(true)
            .with_TFE(true)
            .with_CPD(true)
    }
}

/// Port command and status.
#[bitfield(u32, order = Msb)]
pub struct PxCMD {
    /// Interface communication control.
    #[bits(4)]
    pub ICC: u8,
    pub ASP: bool,
    pub ALPE: bool,
    pub DLAE: bool,
    pub ATAPI: bool,
    pub APSTE: bool,
    #[bits(access = RO)]
    pub FBSCP: bool,
    #[bits(access = RO)]
    pub ESP: bool,
    #[bits(access = RO)]
    pub CPD: bool,
    #[bits(access = RO)]
    pub MPSP: bool,
    #[bits(access = RO)]
    pub HPCP: bool,
    pub PMA: bool,
    #[bits(access = RO)]
    pub CPS: bool,
    /// Command list running (cleared by hardware after ST is cleared).
    #[bits(access = RO)]
    pub CR: bool,
    /// FIS receive running (cleared by hardware after FRE is cleared).
    #[bits(access = RO)]
    pub FR: bool,
    #[bits(access = RO)]
    pub MPSS: bool,
    /// Current command slot.
    #[bits(5, access = RO)]
    pub CCS: u8,
    #[bits(3)]
    __: u8,
    /// FIS receive enable.
    pub FRE: bool,
    /// Command list override.
    pub CLO: bool,
    pub POD: bool,
    pub SUD: bool,
    /// Start command processing.
    pub ST: bool,
}

impl PxCMD {
    /// Any of ST, CLO, FR, CR set means the port engine has to be stopped
    /// before its pointers may change.
    pub const fn engine_active(&self) -> bool {
        self.ST() || self.CLO() || self.FR() || self.CR()
    }
}

/// Task file data.
#[bitfield(u32, order = Msb)]
pub struct PxTFD {
    __: u16,
    /// Latest error register contents.
    pub ERR: u8,
    pub STS_BSY: bool,
    #[bits(3)]
    __: u8,
    pub STS_DRQ: bool,
    #[bits(2)]
    __: u8,
    /// ATA ERR bit.
    pub STS_ERR: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ghc_bit_positions() {
        assert_eq!(GHC::new().with_AE(true).into_bits(), 0x8000_0000);
        assert_eq!(GHC::new().with_IE(true).into_bits(), 0x2);
        assert_eq!(GHC::new().with_HR(true).into_bits(), 0x1);
    }

    #[test]
    fn cap_slot_and_port_counts() {
        let cap = CAP::from_bits(31 << 8 | 5);
        assert_eq!(cap.NCS(), 31);
        assert_eq!(cap.NP(), 5);
    }

    #[test]
    fn port_cmd_bit_positions() {
        assert_eq!(PxCMD::new().with_ST(true).into_bits(), 1 << 0);
        assert_eq!(PxCMD::new().with_CLO(true).into_bits(), 1 << 3);
        assert_eq!(PxCMD::new().with_FRE(true).into_bits(), 1 << 4);
        assert!(PxCMD::from_bits(1 << 14).FR());
        assert!(PxCMD::from_bits(1 << 15).CR());

        assert!(PxCMD::from_bits(0x0001).engine_active());
        assert!(PxCMD::from_bits(0x0008).engine_active());
        assert!(PxCMD::from_bits(0x4000).engine_active());
        assert!(PxCMD::from_bits(0x8000).engine_active());
        assert!(!PxCMD::from_bits(0x0010).engine_active());
    }

    #[test]
    fn irq_source_mask_matches_hardware_value() {
        assert_eq!(PxI::irq_sources().into_bits(), 0xF980_00F1);
    }

    #[test]
    fn tfd_err_is_bit_zero() {
        assert!(PxTFD::from_bits(1).STS_ERR());
        assert!(!PxTFD::from_bits(0x80).STS_ERR());
        assert!(PxTFD::from_bits(0x80).STS_BSY());
        assert_eq!(PxTFD::from_bits(0x3100).ERR(), 0x31);
    }

    #[test]
    fn version_display() {
        use alloc::string::ToString;
        assert_eq!(VS::from_bits(0x0001_0301).to_string(), "1.31");
    }
}
