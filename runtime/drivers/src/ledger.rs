//! Per-driver record of lifecycle state and claimed resources
//!
//! The ledger itself never arbitrates: the registry checks every other
//! holder's ledger and only then records the claim here.

use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;

/// Where a driver is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Inactive,
    Active,
    Failed,
}

/// Whether, and when, the registry may start a driver by itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    /// Never started implicitly; an explicit `start_driver` still works
    Disabled,
    /// Started the first time something asks for its capability
    OnDemand,
    /// Started during boot
    Automatic,
}

/// Half-open physical range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: usize,
    pub end: usize,
}

impl MemoryRange {
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }
}

impl fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} - {:#x}", self.start, self.end)
    }
}

/// One bit per IRQ line or interrupt vector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bitmap256([u64; 4]);

/// Mask of IRQ lines a driver can live with
pub type IrqMask = Bitmap256;

impl Bitmap256 {
    pub const fn empty() -> Self {
        Bitmap256([0; 4])
    }

    pub fn single(bit: u8) -> Self {
        let mut map = Self::empty();
        map.set(bit, true);
        map
    }

    pub const fn from_words(words: [u64; 4]) -> Self {
        Bitmap256(words)
    }

    pub fn get(&self, bit: u8) -> bool {
        self.0[usize::from(bit / 64)] & (1 << (bit % 64)) != 0
    }

    pub fn set(&mut self, bit: u8, value: bool) {
        let word = &mut self.0[usize::from(bit / 64)];
        if value {
            *word |= 1 << (bit % 64);
        } else {
            *word &= !(1 << (bit % 64));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|word| *word == 0)
    }

    pub fn count(&self) -> u32 {
        self.0.iter().map(|word| word.count_ones()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=u8::MAX).filter(move |bit| self.get(*bit))
    }
}

impl FromIterator<u8> for Bitmap256 {
    fn from_iter<I: IntoIterator<Item = u8>>(bits: I) -> Self {
        let mut map = Self::empty();
        for bit in bits {
            map.set(bit, true);
        }
        map
    }
}

/// PCI function address, rendered as `bb:dd.f`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

bitflags! {
    /// Resource categories, for bulk release
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResourceKinds: u8 {
        const MEMORY = 1 << 0;
        const IRQS = 1 << 1;
        const INTERRUPTS = 1 << 2;
        const PCI = 1 << 3;
        const IO_PORTS = 1 << 4;
    }
}

/// Lines and vectors dropped by a bulk release
#[derive(Debug, Default)]
pub(crate) struct Released {
    pub irqs: Bitmap256,
    pub interrupts: Bitmap256,
}

/// Lifecycle state and resource claims of one driver
#[derive(Debug)]
pub struct ResourceLedger {
    pub(crate) state: LifecycleState,
    pub(crate) startup: Startup,
    pub(crate) starting: bool,
    memory: Vec<MemoryRange>,
    irqs: Bitmap256,
    interrupts: Bitmap256,
    pci: Vec<PciAddress>,
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    io_ports: Vec<u16>,
}

impl ResourceLedger {
    pub(crate) fn new(startup: Startup) -> Self {
        Self {
            state: LifecycleState::Inactive,
            startup,
            starting: false,
            memory: Vec::new(),
            irqs: Bitmap256::empty(),
            interrupts: Bitmap256::empty(),
            pci: Vec::new(),
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            io_ports: Vec::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn startup(&self) -> Startup {
        self.startup
    }

    pub fn is_active(&self) -> bool {
        self.state == LifecycleState::Active
    }

    /// Active, or inside its own start hook
    pub(crate) fn holds_claims(&self) -> bool {
        self.is_active() || self.starting
    }

    /// Claimed memory, sorted and non-overlapping
    pub fn memory(&self) -> &[MemoryRange] {
        &self.memory
    }

    pub fn irqs(&self) -> &Bitmap256 {
        &self.irqs
    }

    pub fn interrupts(&self) -> &Bitmap256 {
        &self.interrupts
    }

    pub fn pci_devices(&self) -> &[PciAddress] {
        &self.pci
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub fn io_ports(&self) -> &[u16] {
        &self.io_ports
    }

    pub fn claimed_bytes(&self) -> usize {
        self.memory.iter().map(MemoryRange::size).sum()
    }

    pub fn overlaps_memory(&self, start: usize, end: usize) -> bool {
        for range in &self.memory {
            if range.start >= end {
                break;
            }
            if range.overlaps(start, end) {
                return true;
            }
        }
        false
    }

    /// Merge `[start, end)` into the sorted range list
    pub(crate) fn insert_memory(&mut self, start: usize, end: usize) {
        let mut index = 0;
        while index < self.memory.len() {
            let existing = self.memory[index];
            if existing.start > end {
                self.memory.insert(index, MemoryRange { start, end });
                return;
            }
            if existing.end < start {
                index += 1;
                continue;
            }

            // Touching or overlapping: grow in place, then absorb successors.
            self.memory[index].start = existing.start.min(start);
            if end > existing.end {
                self.memory[index].end = end;
                while index + 1 < self.memory.len() && self.memory[index + 1].start <= end {
                    let absorbed = self.memory.remove(index + 1);
                    let merged = &mut self.memory[index];
                    merged.end = merged.end.max(absorbed.end);
                }
            }
            return;
        }
        self.memory.push(MemoryRange { start, end });
    }

    /// Cut `[start, end)` out of the range list; false if nothing was held
    pub(crate) fn remove_memory(&mut self, start: usize, end: usize) -> bool {
        let mut removed = false;
        let mut index = 0;
        while index < self.memory.len() {
            let existing = self.memory[index];
            if existing.start >= end {
                break;
            }
            if existing.end <= start {
                index += 1;
                continue;
            }

            removed = true;
            if start <= existing.start && existing.end <= end {
                self.memory.remove(index);
                continue;
            }
            if start > existing.start {
                self.memory[index].end = start;
                if existing.end > end {
                    self.memory.insert(
                        index + 1,
                        MemoryRange {
                            start: end,
                            end: existing.end,
                        },
                    );
                    break;
                }
            } else {
                self.memory[index].start = end;
            }
            index += 1;
        }
        removed
    }

    /// Returns false if the line was already held
    pub(crate) fn insert_irq(&mut self, irq: u8) -> bool {
        let fresh = !self.irqs.get(irq);
        self.irqs.set(irq, true);
        fresh
    }

    pub(crate) fn remove_irq(&mut self, irq: u8) -> bool {
        let held = self.irqs.get(irq);
        self.irqs.set(irq, false);
        held
    }

    pub(crate) fn insert_interrupt(&mut self, vector: u8) -> bool {
        let fresh = !self.interrupts.get(vector);
        self.interrupts.set(vector, true);
        fresh
    }

    pub(crate) fn remove_interrupt(&mut self, vector: u8) -> bool {
        let held = self.interrupts.get(vector);
        self.interrupts.set(vector, false);
        held
    }

    pub fn holds_pci(&self, device: &PciAddress) -> bool {
        self.pci.contains(device)
    }

    pub(crate) fn insert_pci(&mut self, device: PciAddress) {
        if !self.holds_pci(&device) {
            self.pci.push(device);
        }
    }

    pub(crate) fn remove_pci(&mut self, device: &PciAddress) -> bool {
        let before = self.pci.len();
        self.pci.retain(|held| held != device);
        self.pci.len() != before
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub fn holds_io_port(&self, port: u16) -> bool {
        self.io_ports.contains(&port)
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub(crate) fn insert_io_port(&mut self, port: u16) {
        if !self.holds_io_port(port) {
            self.io_ports.push(port);
        }
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub(crate) fn remove_io_port(&mut self, port: u16) -> bool {
        let before = self.io_ports.len();
        self.io_ports.retain(|held| *held != port);
        self.io_ports.len() != before
    }

    /// Drop every claim in `kinds`
    pub(crate) fn release(&mut self, kinds: ResourceKinds) -> Released {
        let mut released = Released::default();
        if kinds.contains(ResourceKinds::MEMORY) {
            self.memory.clear();
        }
        if kinds.contains(ResourceKinds::IRQS) {
            released.irqs = core::mem::take(&mut self.irqs);
        }
        if kinds.contains(ResourceKinds::INTERRUPTS) {
            released.interrupts = core::mem::take(&mut self.interrupts);
        }
        if kinds.contains(ResourceKinds::PCI) {
            self.pci.clear();
        }
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        if kinds.contains(ResourceKinds::IO_PORTS) {
            self.io_ports.clear();
        }
        released
    }

    pub fn is_empty(&self) -> bool {
        let ports_empty = {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            {
                self.io_ports.is_empty()
            }
            #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
            {
                true
            }
        };
        self.memory.is_empty()
            && self.irqs.is_empty()
            && self.interrupts.is_empty()
            && self.pci.is_empty()
            && ports_empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    fn ledger() -> ResourceLedger {
        ResourceLedger::new(Startup::OnDemand)
    }

    fn ranges(ledger: &ResourceLedger) -> Vec<(usize, usize)> {
        ledger.memory().iter().map(|r| (r.start, r.end)).collect()
    }

    #[test]
    fn test_insert_sorted() {
        let mut l = ledger();
        l.insert_memory(100, 200);
        l.insert_memory(0, 10);
        l.insert_memory(300, 400);
        assert_eq!(ranges(&l), vec![(0, 10), (100, 200), (300, 400)]);
    }

    #[test]
    fn test_same_range_twice() {
        let mut l = ledger();
        l.insert_memory(0x1000, 0x2000);
        l.insert_memory(0x1000, 0x2000);
        assert_eq!(ranges(&l), vec![(0x1000, 0x2000)]);
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let mut l = ledger();
        l.insert_memory(0, 10);
        l.insert_memory(10, 20);
        assert_eq!(ranges(&l), vec![(0, 20)]);

        l.insert_memory(30, 40);
        l.insert_memory(25, 30);
        assert_eq!(ranges(&l), vec![(0, 20), (25, 40)]);
    }

    #[test]
    fn test_bridge_absorbs_successors() {
        let mut l = ledger();
        l.insert_memory(0, 10);
        l.insert_memory(20, 30);
        l.insert_memory(40, 50);
        l.insert_memory(70, 80);
        l.insert_memory(5, 45);
        assert_eq!(ranges(&l), vec![(0, 50), (70, 80)]);
    }

    #[test]
    fn test_remove_shapes() {
        let mut l = ledger();
        l.insert_memory(0, 100);

        // interior split
        assert!(l.remove_memory(40, 60));
        assert_eq!(ranges(&l), vec![(0, 40), (60, 100)]);

        // left trim
        assert!(l.remove_memory(0, 10));
        assert_eq!(ranges(&l), vec![(10, 40), (60, 100)]);

        // right trim spanning a gap
        assert!(l.remove_memory(30, 70));
        assert_eq!(ranges(&l), vec![(10, 30), (70, 100)]);

        // full containment
        assert!(l.remove_memory(0, 200));
        assert!(l.memory().is_empty());

        assert!(!l.remove_memory(0, 200));
    }

    #[test]
    fn test_release_symmetry() {
        let mut l = ledger();
        l.insert_memory(0x1000, 0x3000);
        l.insert_memory(0x5000, 0x6000);
        l.remove_memory(0x2000, 0x5800);
        l.insert_memory(0x2800, 0x2c00);
        l.remove_memory(0x1000, 0x2000);
        l.remove_memory(0x2800, 0x2c00);
        l.remove_memory(0x5800, 0x6000);
        assert!(l.memory().is_empty());
        assert_eq!(l.claimed_bytes(), 0);
    }

    #[test]
    fn test_overlap_is_half_open() {
        let mut l = ledger();
        l.insert_memory(10, 20);
        assert!(!l.overlaps_memory(0, 10));
        assert!(!l.overlaps_memory(20, 30));
        assert!(l.overlaps_memory(19, 21));
        assert!(l.overlaps_memory(0, 100));
    }

    #[test]
    fn test_bitmap() {
        let mut map: Bitmap256 = [0, 63, 64, 255].into_iter().collect();
        assert_eq!(map.count(), 4);
        assert!(map.get(255));
        assert!(!map.get(1));
        map.set(63, false);
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![0, 64, 255]);
    }

    #[test]
    fn test_release_reports_lines() {
        let mut l = ledger();
        l.insert_irq(3);
        l.insert_interrupt(32);
        l.insert_pci(PciAddress::new(0, 2, 0));
        l.insert_memory(0, 4096);

        let released = l.release(ResourceKinds::all());
        assert!(released.irqs.get(3));
        assert!(released.interrupts.get(32));
        assert!(l.is_empty());
    }

    #[test]
    fn test_pci_display() {
        assert_eq!(PciAddress::new(0, 0x1f, 3).to_string(), "00:1f.3");
    }
}
