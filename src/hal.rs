use core::ptr::NonNull;

/// Host services the driver depends on.
///
/// The implementor is the glue to the embedding kernel or VMM: it maps
/// device memory, translates DMA addresses, keeps a monotonic clock, and
/// routes interrupts. All methods are free of driver state.
pub trait Hal: 'static {
    /// Convert a virtual address to a bus/physical address.
    ///
    /// Only called when the controller was not assigned to an IOMMU
    /// context (see [`Hal::assign_pci_device`]).
    fn virt_to_phys(va: usize) -> usize;

    /// Monotonic time in milliseconds.
    fn current_ms() -> u64;

    /// Order DMA-visible memory writes before a subsequent MMIO doorbell.
    fn flush_dcache();

    /// Map `size` bytes of I/O memory at physical address `phys` with
    /// device (uncached) semantics.
    fn alloc_iomem(phys: u64, size: usize) -> Option<NonNull<u8>>;

    /// Assign the PCI function to an IOMMU context. Returns `true` on
    /// success, in which case DMA addresses are identity-mapped and
    /// [`Hal::virt_to_phys`] is not used.
    fn assign_pci_device(bdf: u32) -> bool;

    /// Attach an interrupt handler for the given GSI.
    fn attach_irq(gsi: u32) -> bool;
}

/// Bound for every hardware wait in the driver, in milliseconds.
pub(crate) const TIMEOUT_MS: u64 = 200;

/// Spin until `cond` holds or `timeout` milliseconds have elapsed.
/// Returns `true` iff the condition was satisfied.
pub(crate) fn wait_until_timeout<H: Hal>(cond: impl Fn() -> bool, timeout: u64) -> bool {
    let start = H::current_ms();
    loop {
        if cond() {
            return true;
        }
        if H::current_ms() - start > timeout {
            return false;
        }
        core::hint::spin_loop();
    }
}
