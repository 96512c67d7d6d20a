//! Installed drivers, capability lookup and interrupt fan-out
//!
//! One [`Registry`] exists per kernel. Drivers are installed once and never
//! removed, so a [`DriverId`] stays valid for the registry's lifetime.
//!
//! All ledgers and subscriber tables sit behind a single [`IrqSpinlock`].
//! Driver hooks, event listeners and reference callbacks always run with
//! that lock released, so they are free to call back into the registry.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;
use log::{debug, error, info, warn};

use crate::reference::Terminate;
use crate::sync::IrqSpinlock;
use crate::{
    Bitmap256, Capabilities, Capability, Driver, DriverError, InterruptController,
    LifecycleState, ResourceKinds, ResourceLedger, Result, Startup,
};

/// IRQ routing always targets the boot CPU
const BOOT_CPU: u32 = 0;

/// Stable index of an installed driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverId(u32);

impl DriverId {
    pub(crate) fn from_index(index: usize) -> Self {
        DriverId(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver#{}", self.0)
    }
}

/// A capability of a specific installed driver
pub struct DriverHandle<C: ?Sized> {
    id: DriverId,
    capability: Arc<C>,
}

impl<C: ?Sized> DriverHandle<C> {
    pub fn id(&self) -> DriverId {
        self.id
    }

    pub fn capability(&self) -> &Arc<C> {
        &self.capability
    }

    pub fn into_inner(self) -> Arc<C> {
        self.capability
    }
}

impl<C: ?Sized> Clone for DriverHandle<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            capability: self.capability.clone(),
        }
    }
}

impl<C: ?Sized> Deref for DriverHandle<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.capability
    }
}

impl<C: ?Sized> fmt::Debug for DriverHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverHandle").field("id", &self.id).finish()
    }
}

/// Lifecycle notifications delivered to registry listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent<'a> {
    Installed(DriverId),
    Started(DriverId),
    /// Stopped cleanly (`reason` is `None`) or failed
    Stopped {
        id: DriverId,
        reason: Option<&'a str>,
    },
}

type Listener = Arc<dyn Fn(&DriverEvent<'_>) + Send + Sync>;

pub(crate) struct Entry {
    pub driver: Arc<dyn Driver>,
    pub capabilities: Capabilities,
    pub ledger: ResourceLedger,
    pub references: Vec<Weak<dyn Terminate>>,
}

pub(crate) struct Inner {
    pub entries: Vec<Entry>,
    pub irq_subscribers: [Vec<DriverId>; 256],
    pub interrupt_subscribers: [Vec<DriverId>; 256],
}

impl Inner {
    pub fn entry(&self, id: DriverId) -> Result<&Entry> {
        self.entries
            .get(id.index())
            .ok_or(DriverError::ResourceNotFound)
    }

    pub fn entry_mut(&mut self, id: DriverId) -> Result<&mut Entry> {
        self.entries
            .get_mut(id.index())
            .ok_or(DriverError::ResourceNotFound)
    }

    /// Name of another claim-holding driver whose ledger satisfies `conflicts`
    pub fn holder(
        &self,
        id: DriverId,
        conflicts: impl Fn(&ResourceLedger) -> bool,
    ) -> Option<&'static str> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != id.index())
            .find(|(_, entry)| entry.ledger.holds_claims() && conflicts(&entry.ledger))
            .map(|(_, entry)| entry.driver.name())
    }

    /// Record an IRQ subscription; true if this is the line's first subscriber
    pub fn subscribe_irq(&mut self, id: DriverId, irq: u8) -> Result<bool> {
        if !self.entry_mut(id)?.ledger.insert_irq(irq) {
            return Ok(false);
        }
        let subscribers = &mut self.irq_subscribers[usize::from(irq)];
        subscribers.push(id);
        Ok(subscribers.len() == 1)
    }

    /// Every IRQ line with at least one subscriber
    pub fn subscribed_irqs(&self) -> Bitmap256 {
        let mut lines = Bitmap256::empty();
        for (irq, subscribers) in self.irq_subscribers.iter().enumerate() {
            if !subscribers.is_empty() {
                lines.set(irq as u8, true);
            }
        }
        lines
    }

    /// Drop `kinds` from a ledger; returns the IRQ lines nobody listens to anymore
    pub fn release(&mut self, id: DriverId, kinds: ResourceKinds) -> Bitmap256 {
        let released = self.entries[id.index()].ledger.release(kinds);
        let mut orphaned = Bitmap256::empty();
        for irq in released.irqs.iter() {
            let subscribers = &mut self.irq_subscribers[usize::from(irq)];
            subscribers.retain(|subscriber| *subscriber != id);
            if subscribers.is_empty() {
                orphaned.set(irq, true);
            }
        }
        for vector in released.interrupts.iter() {
            self.interrupt_subscribers[usize::from(vector)].retain(|subscriber| *subscriber != id);
        }
        orphaned
    }
}

/// Every installed driver, its ledger and its observers
pub struct Registry {
    pub(crate) inner: IrqSpinlock<Inner>,
    listeners: IrqSpinlock<Vec<Listener>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: IrqSpinlock::new(Inner {
                entries: Vec::new(),
                irq_subscribers: core::array::from_fn(|_| Vec::new()),
                interrupt_subscribers: core::array::from_fn(|_| Vec::new()),
            }),
            listeners: IrqSpinlock::new(Vec::new()),
        }
    }

    /// Add a driver; it starts inactive with the policy from [`Driver::startup`]
    pub fn install<D: Driver>(&self, driver: Arc<D>) -> DriverId {
        let mut capabilities = Capabilities::new();
        driver.clone().provide(&mut capabilities);
        capabilities.provide::<dyn Driver>(driver.clone());

        let startup = driver.startup();
        let name = driver.name();
        let id = {
            let mut inner = self.inner.lock();
            let id = DriverId::from_index(inner.entries.len());
            inner.entries.push(Entry {
                driver,
                capabilities,
                ledger: ResourceLedger::new(startup),
                references: Vec::new(),
            });
            id
        };
        debug!("INSTALL {} as {} ({:?})", name, id, startup);
        self.emit(&DriverEvent::Installed(id));
        id
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> impl Iterator<Item = DriverId> {
        (0..self.len()).map(DriverId::from_index)
    }

    pub fn driver(&self, id: DriverId) -> Option<Arc<dyn Driver>> {
        self.inner.lock().entry(id).ok().map(|entry| entry.driver.clone())
    }

    pub fn name(&self, id: DriverId) -> &'static str {
        self.inner
            .lock()
            .entry(id)
            .map(|entry| entry.driver.name())
            .unwrap_or("<unknown>")
    }

    pub fn state(&self, id: DriverId) -> Option<LifecycleState> {
        self.with_ledger(id, ResourceLedger::state)
    }

    pub fn startup(&self, id: DriverId) -> Option<Startup> {
        self.with_ledger(id, ResourceLedger::startup)
    }

    pub fn set_startup(&self, id: DriverId, startup: Startup) -> Result<()> {
        self.inner.lock().entry_mut(id)?.ledger.startup = startup;
        Ok(())
    }

    /// Inspect one driver's ledger under the registry lock
    pub fn with_ledger<R>(&self, id: DriverId, f: impl FnOnce(&ResourceLedger) -> R) -> Option<R> {
        self.inner.lock().entry(id).ok().map(|entry| f(&entry.ledger))
    }

    /// The `C` cast of a specific driver, if it provides one
    pub fn handle<C: ?Sized + Capability>(&self, id: DriverId) -> Option<DriverHandle<C>> {
        let inner = self.inner.lock();
        let entry = inner.entry(id).ok()?;
        entry
            .capabilities
            .get::<C>()
            .map(|capability| DriverHandle { id, capability })
    }

    /// Every installed driver of capability `C`, in install order
    pub fn drivers_of<C: ?Sized + Capability>(&self) -> Vec<DriverHandle<C>> {
        self.collect::<C>(|_| true)
    }

    /// Active drivers of capability `C`, in install order
    pub fn active_of<C: ?Sized + Capability>(&self) -> Vec<DriverHandle<C>> {
        self.collect::<C>(ResourceLedger::is_active)
    }

    fn collect<C: ?Sized + Capability>(
        &self,
        filter: impl Fn(&ResourceLedger) -> bool,
    ) -> Vec<DriverHandle<C>> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.driver.driver_type().is_type(C::TYPE))
            .filter(|(_, entry)| filter(&entry.ledger))
            .filter_map(|(index, entry)| {
                entry.capabilities.get::<C>().map(|capability| DriverHandle {
                    id: DriverId::from_index(index),
                    capability,
                })
            })
            .collect()
    }

    pub fn find_active<C: ?Sized + Capability>(&self) -> Option<DriverHandle<C>> {
        self.active_of::<C>().into_iter().next()
    }

    /// First active driver of capability `C`, starting one if none is running
    ///
    /// Candidates are tried in install order, skipping disabled and failed
    /// drivers; a candidate that fails to start is logged and passed over.
    pub fn find_and_activate<C: ?Sized + Capability>(&self) -> Result<DriverHandle<C>> {
        self.activate::<C>(None)
    }

    pub(crate) fn activate<C: ?Sized + Capability>(
        &self,
        requester: Option<DriverId>,
    ) -> Result<DriverHandle<C>> {
        if let Some(active) = self.find_active::<C>() {
            return Ok(active);
        }

        let candidates: Vec<DriverId> = {
            let inner = self.inner.lock();
            inner
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.driver.driver_type().is_type(C::TYPE))
                .filter(|(_, entry)| {
                    entry.ledger.startup != Startup::Disabled
                        && entry.ledger.state == LifecycleState::Inactive
                        && !entry.ledger.starting
                })
                .map(|(index, _)| DriverId::from_index(index))
                .collect()
        };

        for id in candidates {
            if let Some(requester) = requester {
                info!("REQUEST {} -> {}", self.name(requester), self.name(id));
            }
            match self.start_driver(id) {
                Ok(()) => match self.handle::<C>(id) {
                    Some(handle) => return Ok(handle),
                    None => warn!("{} is tagged {} but provides no cast", self.name(id), C::TYPE.name),
                },
                Err(err) => warn!("{}", err),
            }
        }

        Err(DriverError::DependencyMissing {
            capability: C::TYPE.name,
        })
    }

    /// Start every driver installed with [`Startup::Automatic`]
    ///
    /// Failures are logged and skipped. Returns how many drivers are now active.
    pub fn start_automatic_drivers(&self) -> usize {
        let automatic: Vec<DriverId> = {
            let inner = self.inner.lock();
            inner
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.ledger.startup == Startup::Automatic)
                .map(|(index, _)| DriverId::from_index(index))
                .collect()
        };

        automatic
            .into_iter()
            .filter(|id| match self.start_driver(*id) {
                Ok(()) => true,
                Err(err) => {
                    error!("{}", err);
                    false
                }
            })
            .count()
    }

    pub fn subscribe_events(&self, listener: impl Fn(&DriverEvent<'_>) + Send + Sync + 'static) {
        self.listeners.lock().push(Arc::new(listener));
    }

    pub(crate) fn emit(&self, event: &DriverEvent<'_>) {
        let listeners: Vec<Listener> = self.listeners.lock().clone();
        for listener in listeners {
            listener(event);
        }
    }

    /// Deliver a hardware IRQ to every active subscriber of the line
    pub fn on_irq(&self, irq: u8) {
        let subscribers = self.subscribers(irq, |inner| &inner.irq_subscribers);
        if subscribers.is_empty() {
            debug!("spurious IRQ {}", irq);
        }
        for driver in subscribers {
            driver.on_irq(irq);
        }
    }

    /// Offer a CPU interrupt to subscribers in order until one handles it
    pub fn on_interrupt(&self, vector: u8) -> bool {
        self.subscribers(vector, |inner| &inner.interrupt_subscribers)
            .into_iter()
            .any(|driver| driver.on_interrupt(vector))
    }

    fn subscribers(
        &self,
        line: u8,
        table: impl Fn(&Inner) -> &[Vec<DriverId>; 256],
    ) -> Vec<Arc<dyn Driver>> {
        let inner = self.inner.lock();
        table(&inner)[usize::from(line)]
            .iter()
            .map(|id| &inner.entries[id.index()])
            .filter(|entry| entry.ledger.is_active())
            .map(|entry| entry.driver.clone())
            .collect()
    }

    /// Enable or disable `lines` on every active controller that routes them
    pub(crate) fn route_irqs(&self, lines: &Bitmap256, enable: bool) {
        if lines.is_empty() {
            return;
        }
        for controller in self.active_of::<dyn InterruptController>() {
            let range = controller.irq_range();
            for irq in lines.iter().filter(|irq| range.contains(irq)) {
                if enable {
                    controller.enable_irq(BOOT_CPU, irq);
                } else {
                    controller.disable_irq(BOOT_CPU, irq);
                }
            }
        }
    }

    /// Enable already-subscribed `lines` on a controller that just started
    pub(crate) fn route_to_controller(&self, id: DriverId, lines: &Bitmap256) {
        if lines.is_empty() {
            return;
        }
        let Some(controller) = self.handle::<dyn InterruptController>(id) else {
            return;
        };
        let range = controller.irq_range();
        for irq in lines.iter().filter(|irq| range.contains(irq)) {
            controller.enable_irq(BOOT_CPU, irq);
        }
    }

    pub(crate) fn attach_reference(&self, target: DriverId, reference: Weak<dyn Terminate>) {
        let mut inner = self.inner.lock();
        if let Ok(entry) = inner.entry_mut(target) {
            entry.references.retain(|existing| existing.strong_count() > 0);
            entry.references.push(reference);
        }
    }

    pub(crate) fn detach_reference(&self, target: DriverId, reference: *const ()) {
        let mut inner = self.inner.lock();
        if let Ok(entry) = inner.entry_mut(target) {
            entry.references.retain(|existing| {
                existing.strong_count() > 0 && existing.as_ptr() as *const () != reference
            });
        }
    }

    /// Number of live references observing `target`
    pub fn reference_count(&self, target: DriverId) -> usize {
        self.inner
            .lock()
            .entry(target)
            .map(|entry| {
                entry
                    .references
                    .iter()
                    .filter(|reference| reference.strong_count() > 0)
                    .count()
            })
            .unwrap_or(0)
    }
}
