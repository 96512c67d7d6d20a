use alloc::vec::Vec;
use core::fmt;
use log::info;

use crate::registry::{DriverId, Registry};
use crate::{LifecycleState, MemoryRange, PciAddress, Startup};

/// Point-in-time report of one driver and everything it holds
#[derive(Debug, Clone)]
pub struct DriverSummary {
    pub id: DriverId,
    pub name: &'static str,
    pub description: &'static str,
    pub lineage: Vec<&'static str>,
    pub state: LifecycleState,
    pub startup: Startup,
    pub memory: Vec<MemoryRange>,
    pub io_ports: Vec<u16>,
    pub irqs: Vec<u8>,
    pub interrupts: Vec<u8>,
    pub pci_devices: Vec<PciAddress>,
}

impl DriverSummary {
    fn marker(&self) -> &'static str {
        match (self.state, self.startup) {
            (LifecycleState::Active, _) => "[+]",
            (LifecycleState::Failed, _) => "[!]",
            (LifecycleState::Inactive, Startup::Disabled) => "[x]",
            (LifecycleState::Inactive, _) => "[.]",
        }
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, label: &str, items: &[T]) -> fmt::Result {
    if items.is_empty() {
        return Ok(());
    }
    write!(f, "\n    {}:", label)?;
    for item in items {
        write!(f, " {}", item)?;
    }
    Ok(())
}

impl fmt::Display for DriverSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} - {}", self.marker(), self.name, self.description)?;
        if self.lineage.len() > 1 {
            write!(f, " ({})", self.lineage[1..].join(" / "))?;
        }
        if !self.memory.is_empty() {
            write!(f, "\n    Memory:")?;
            for range in &self.memory {
                write!(f, "\n      {}", range)?;
            }
        }
        let ports: Vec<_> = self.io_ports.iter().map(|port| HexPort(*port)).collect();
        write_list(f, "I/O Ports", &ports)?;
        write_list(f, "IRQs", &self.irqs)?;
        write_list(f, "Interrupts", &self.interrupts)?;
        write_list(f, "PCI Devices", &self.pci_devices)
    }
}

struct HexPort(u16);

impl fmt::Display for HexPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Registry {
    pub fn summary(&self, id: DriverId) -> Option<DriverSummary> {
        let inner = self.inner.lock();
        let entry = inner.entry(id).ok()?;
        let ledger = &entry.ledger;
        let ty = entry.driver.driver_type();

        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        let io_ports = ledger.io_ports().to_vec();
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
        let io_ports = Vec::new();

        Some(DriverSummary {
            id,
            name: entry.driver.name(),
            description: entry.driver.description(),
            lineage: ty.lineage().map(|ty| ty.description).collect(),
            state: ledger.state(),
            startup: ledger.startup(),
            memory: ledger.memory().to_vec(),
            io_ports,
            irqs: ledger.irqs().iter().collect(),
            interrupts: ledger.interrupts().iter().collect(),
            pci_devices: ledger.pci_devices().to_vec(),
        })
    }

    /// Write every driver's summary to the log
    pub fn log_summary(&self) {
        info!("Drivers:");
        for summary in self.ids().filter_map(|id| self.summary(id)) {
            info!("{}", summary);
        }
    }
}
