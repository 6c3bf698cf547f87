use core::fmt;

/// Driver error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AhciError {
    /// BIOS/OS handoff is still pending (BOHC non-zero).
    BiosOwnershipBusy,
    /// Memory decode or bus-master DMA disabled, or the ABAR is not a
    /// 32-bit memory BAR.
    PciMisconfigured,
    /// Could not map a register window.
    MappingFailed,
    /// A status-register wait exceeded the timeout.
    DeviceUnresponsive,
    /// IDENTIFY reports features the driver does not support.
    UnsupportedDrive,
    /// Unaligned transfer length, out-of-bounds DMA descriptor, or PRD
    /// count overflow.
    InvalidArgument,
    /// The target command slot is still owned by the device.
    BackpressureRequired,
    /// TFD.ERR observed; the port was reinitialized.
    DeviceError,
    /// The host service could not attach the IRQ handler.
    IrqAttachFailed,
}

impl AhciError {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BiosOwnershipBusy => "BIOS ownership handoff pending",
            Self::PciMisconfigured => "PCI function lacks mem-decode/busmaster or a 32bit BAR",
            Self::MappingFailed => "could not map the HBA registers",
            Self::DeviceUnresponsive => "register wait timed out",
            Self::UnsupportedDrive => "drive reports unsupported features",
            Self::InvalidArgument => "invalid transfer length or DMA descriptor",
            Self::BackpressureRequired => "all command slots are in flight",
            Self::DeviceError => "device signalled a task-file error",
            Self::IrqAttachFailed => "could not attach the host IRQ",
        }
    }
}

impl fmt::Display for AhciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_as_str() {
        use alloc::string::ToString;

        assert_eq!(
            AhciError::BiosOwnershipBusy.to_string(),
            "BIOS ownership handoff pending"
        );
        assert_eq!(
            AhciError::BackpressureRequired.to_string(),
            AhciError::BackpressureRequired.as_str()
        );
    }

    #[test]
    fn variants_are_distinct() {
        let all = [
            AhciError::BiosOwnershipBusy,
            AhciError::PciMisconfigured,
            AhciError::MappingFailed,
            AhciError::DeviceUnresponsive,
            AhciError::UnsupportedDrive,
            AhciError::InvalidArgument,
            AhciError::BackpressureRequired,
            AhciError::DeviceError,
            AhciError::IrqAttachFailed,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
            assert!(!a.as_str().is_empty());
        }
    }
}
