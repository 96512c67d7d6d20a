//! Resource arbitration, as seen from inside a driver hook
//!
//! Memory ranges, PCI functions and I/O ports are exclusive: a claim is
//! refused if any other active (or starting) driver holds an overlapping
//! claim. IRQ lines and interrupt vectors are shared and fan out to every
//! subscriber. Each check and the matching record happen under the
//! registry lock, so two racing claims can never both succeed.

use log::{debug, warn};

use crate::registry::{DriverHandle, DriverId, Registry};
use crate::{
    Bitmap256, Capability, DriverError, InterruptController, IrqMask, LifecycleState, PciAddress,
    Result, Startup, INTERRUPT_CONTROLLER,
};

/// Handle passed to driver hooks, bound to the driver being started or stopped
pub struct DriverApi<'a> {
    registry: &'a Registry,
    id: DriverId,
}

impl<'a> DriverApi<'a> {
    pub fn new(registry: &'a Registry, id: DriverId) -> Self {
        Self { registry, id }
    }

    pub fn id(&self) -> DriverId {
        self.id
    }

    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    fn name(&self) -> &'static str {
        self.registry.name(self.id)
    }

    /// Claim `[start, start + size)` exclusively
    pub fn subscribe_memory(&self, start: usize, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let end = memory_end(start, size)?;
        let mut inner = self.registry.inner.lock();
        inner.entry(self.id)?;
        if let Some(owner) = inner.holder(self.id, |ledger| ledger.overlaps_memory(start, end)) {
            warn!(
                "{}: memory {:#x} - {:#x} already held by {}",
                self.name_locked(&inner),
                start,
                end,
                owner
            );
            return Err(DriverError::ResourceInUse { owner });
        }
        inner.entries[self.id.index()]
            .ledger
            .insert_memory(start, end);
        Ok(())
    }

    /// Release `[start, start + size)`, trimming or splitting held ranges
    pub fn unsubscribe_memory(&self, start: usize, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let end = memory_end(start, size)?;
        let mut inner = self.registry.inner.lock();
        if inner.entry_mut(self.id)?.ledger.remove_memory(start, end) {
            Ok(())
        } else {
            Err(DriverError::ResourceNotFound)
        }
    }

    pub fn is_subscribed_to_memory(&self, start: usize, size: usize) -> bool {
        let end = start.saturating_add(size);
        self.registry
            .with_ledger(self.id, |ledger| ledger.overlaps_memory(start, end))
            .unwrap_or(false)
    }

    /// Subscribe to a hardware IRQ line; idempotent
    ///
    /// The first subscriber to a line enables it on the active interrupt
    /// controllers that route it.
    pub fn subscribe_irq(&self, irq: u8) -> Result<()> {
        let first = self.registry.inner.lock().subscribe_irq(self.id, irq)?;
        if first {
            self.registry.route_irqs(&Bitmap256::single(irq), true);
        }
        Ok(())
    }

    pub fn unsubscribe_irq(&self, irq: u8) -> Result<()> {
        let orphaned = {
            let mut inner = self.registry.inner.lock();
            if !inner.entry_mut(self.id)?.ledger.remove_irq(irq) {
                return Err(DriverError::ResourceNotFound);
            }
            let subscribers = &mut inner.irq_subscribers[usize::from(irq)];
            subscribers.retain(|subscriber| *subscriber != self.id);
            subscribers.is_empty()
        };
        if orphaned {
            self.registry.route_irqs(&Bitmap256::single(irq), false);
        }
        Ok(())
    }

    /// Subscribe to any free IRQ line in `mask`
    ///
    /// Interrupt controllers are asked in install order; inactive ones are
    /// started on demand. A line already held by this driver that matches
    /// `mask` is returned as is.
    pub fn subscribe_available_irq(&self, mask: &IrqMask) -> Result<u8> {
        {
            let inner = self.registry.inner.lock();
            let held = inner.entry(self.id)?.ledger.irqs().iter().find(|irq| mask.get(*irq));
            if let Some(irq) = held {
                return Ok(irq);
            }
        }

        let controllers = self.registry.drivers_of::<dyn InterruptController>();
        if controllers.is_empty() {
            return Err(DriverError::DependencyMissing {
                capability: INTERRUPT_CONTROLLER.name,
            });
        }

        for controller in controllers {
            if !self.ensure_active(controller.id()) {
                continue;
            }
            let range = controller.irq_range();
            let claimed = {
                let mut inner = self.registry.inner.lock();
                let free = range
                    .filter(|irq| mask.get(*irq))
                    .find(|irq| inner.irq_subscribers[usize::from(*irq)].is_empty());
                match free {
                    Some(irq) => Some((irq, inner.subscribe_irq(self.id, irq)?)),
                    None => None,
                }
            };
            if let Some((irq, first)) = claimed {
                debug!("{}: assigned IRQ {} from {}", self.name(), irq, self.registry.name(controller.id()));
                if first {
                    self.registry.route_irqs(&Bitmap256::single(irq), true);
                }
                return Ok(irq);
            }
        }

        Err(DriverError::ResourceInUse {
            owner: INTERRUPT_CONTROLLER.name,
        })
    }

    fn ensure_active(&self, id: DriverId) -> bool {
        match self.registry.with_ledger(id, |ledger| (ledger.state(), ledger.startup())) {
            Some((LifecycleState::Active, _)) => true,
            Some((LifecycleState::Inactive, Startup::OnDemand | Startup::Automatic)) => {
                self.registry.start_driver(id).is_ok()
            }
            _ => false,
        }
    }

    /// Subscribe to a CPU interrupt vector; shared with other subscribers
    pub fn subscribe_interrupt(&self, vector: u8) -> Result<()> {
        let mut inner = self.registry.inner.lock();
        if inner.entry_mut(self.id)?.ledger.insert_interrupt(vector) {
            inner.interrupt_subscribers[usize::from(vector)].push(self.id);
        }
        Ok(())
    }

    pub fn unsubscribe_interrupt(&self, vector: u8) -> Result<()> {
        let mut inner = self.registry.inner.lock();
        if !inner.entry_mut(self.id)?.ledger.remove_interrupt(vector) {
            return Err(DriverError::ResourceNotFound);
        }
        inner.interrupt_subscribers[usize::from(vector)].retain(|subscriber| *subscriber != self.id);
        Ok(())
    }

    /// Claim a PCI function exclusively
    pub fn subscribe_pci(&self, device: PciAddress) -> Result<()> {
        let mut inner = self.registry.inner.lock();
        inner.entry(self.id)?;
        if let Some(owner) = inner.holder(self.id, |ledger| ledger.holds_pci(&device)) {
            warn!("{}: PCI {} already held by {}", self.name_locked(&inner), device, owner);
            return Err(DriverError::ResourceInUse { owner });
        }
        inner.entries[self.id.index()].ledger.insert_pci(device);
        Ok(())
    }

    pub fn unsubscribe_pci(&self, device: PciAddress) -> Result<()> {
        let mut inner = self.registry.inner.lock();
        if inner.entry_mut(self.id)?.ledger.remove_pci(&device) {
            Ok(())
        } else {
            Err(DriverError::ResourceNotFound)
        }
    }

    /// Claim an I/O port exclusively, returning it for convenience
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub fn subscribe_io_port(&self, port: u16) -> Result<u16> {
        let mut inner = self.registry.inner.lock();
        inner.entry(self.id)?;
        if let Some(owner) = inner.holder(self.id, |ledger| ledger.holds_io_port(port)) {
            warn!("{}: I/O port {:#x} already held by {}", self.name_locked(&inner), port, owner);
            return Err(DriverError::ResourceInUse { owner });
        }
        inner.entries[self.id.index()].ledger.insert_io_port(port);
        Ok(port)
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub fn unsubscribe_io_port(&self, port: u16) -> Result<()> {
        let mut inner = self.registry.inner.lock();
        if inner.entry_mut(self.id)?.ledger.remove_io_port(port) {
            Ok(())
        } else {
            Err(DriverError::ResourceNotFound)
        }
    }

    /// Resolve a dependency by capability, logging who asked for it
    pub fn find_and_activate<C: ?Sized + Capability>(&self) -> Result<DriverHandle<C>> {
        self.registry.activate::<C>(Some(self.id))
    }

    /// Give up: mark this driver failed and release everything it holds
    pub fn fail(&self, reason: &str) {
        self.registry.fail_driver(self.id, reason);
    }

    fn name_locked(&self, inner: &crate::registry::Inner) -> &'static str {
        inner
            .entry(self.id)
            .map(|entry| entry.driver.name())
            .unwrap_or("<unknown>")
    }
}

impl core::fmt::Debug for DriverApi<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DriverApi").field("driver", &self.id).finish()
    }
}

/// End of `[start, start + size)`; a range past the top of the address space
/// names no memory that could be held
fn memory_end(start: usize, size: usize) -> Result<usize> {
    start.checked_add(size).ok_or(DriverError::ResourceNotFound)
}
