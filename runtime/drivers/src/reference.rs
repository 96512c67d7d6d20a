//! Weak references to drivers and cascade shutdown
//!
//! A [`DriverReference`] is an observer, not an owner. It registers itself
//! on the target's back-reference list; when the target stops or fails the
//! registry zeroes the reference and runs its callback exactly once.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::registry::{DriverHandle, DriverId, Registry};
use crate::sync::IrqSpinlock;
use crate::Capability;

type Callback = Arc<dyn Fn(&Registry) + Send + Sync>;

/// Entry on a driver's back-reference list
pub(crate) trait Terminate: Send + Sync {
    fn terminate(&self, registry: &Registry, stopped: DriverId);
}

struct Slot<C: ?Sized> {
    target: IrqSpinlock<Option<DriverHandle<C>>>,
    on_terminated: IrqSpinlock<Option<Callback>>,
}

impl<C: ?Sized + Capability> Terminate for Slot<C> {
    fn terminate(&self, registry: &Registry, stopped: DriverId) {
        let cleared = {
            let mut target = self.target.lock();
            match target.as_ref() {
                Some(handle) if handle.id() == stopped => target.take().is_some(),
                _ => false,
            }
        };
        if !cleared {
            return;
        }
        let callback = self.on_terminated.lock().clone();
        if let Some(callback) = callback {
            callback(registry);
        }
    }
}

/// Nullable, self-clearing reference to a driver capability
pub struct DriverReference<C: ?Sized + Capability> {
    slot: Arc<Slot<C>>,
}

impl<C: ?Sized + Capability> Default for DriverReference<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ?Sized + Capability> DriverReference<C> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Slot {
                target: IrqSpinlock::new(None),
                on_terminated: IrqSpinlock::new(None),
            }),
        }
    }

    pub fn with_callback(callback: impl Fn(&Registry) + Send + Sync + 'static) -> Self {
        let reference = Self::new();
        reference.set_on_terminated(callback);
        reference
    }

    /// Called after the reference has been zeroed by a stop or failure
    pub fn set_on_terminated(&self, callback: impl Fn(&Registry) + Send + Sync + 'static) {
        *self.slot.on_terminated.lock() = Some(Arc::new(callback));
    }

    /// Point at `target`, leaving the previous target's back-reference list
    pub fn set(&self, registry: &Registry, target: Option<DriverHandle<C>>) {
        let mut current = self.slot.target.lock();
        let previous = current.as_ref().map(DriverHandle::id);
        let next = target.as_ref().map(DriverHandle::id);

        if previous != next {
            if let Some(previous) = previous {
                registry.detach_reference(previous, self.token());
            }
            if let Some(next) = next {
                let weak: Weak<Slot<C>> = Arc::downgrade(&self.slot);
                registry.attach_reference(next, weak);
            }
        }
        *current = target;
    }

    pub fn clear(&self, registry: &Registry) {
        self.set(registry, None);
    }

    pub fn get(&self) -> Option<Arc<C>> {
        self.slot
            .target
            .lock()
            .as_ref()
            .map(|handle| handle.capability().clone())
    }

    pub fn handle(&self) -> Option<DriverHandle<C>> {
        self.slot.target.lock().clone()
    }

    pub fn target(&self) -> Option<DriverId> {
        self.slot.target.lock().as_ref().map(DriverHandle::id)
    }

    pub fn is_set(&self) -> bool {
        self.slot.target.lock().is_some()
    }

    fn token(&self) -> *const () {
        Arc::as_ptr(&self.slot) as *const ()
    }
}

/// A [`DriverReference`] that resolves itself through the registry on use
pub struct AutomaticDriverReference<C: ?Sized + Capability> {
    reference: DriverReference<C>,
    resolving: AtomicBool,
}

impl<C: ?Sized + Capability> Default for AutomaticDriverReference<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ?Sized + Capability> AutomaticDriverReference<C> {
    pub fn new() -> Self {
        Self {
            reference: DriverReference::new(),
            resolving: AtomicBool::new(false),
        }
    }

    /// Current target, activating a provider of `C` if there is none
    ///
    /// Returns `None` when nothing can be activated, or when called again
    /// while a resolution is already under way.
    pub fn get(&self, registry: &Registry) -> Option<Arc<C>> {
        if let Some(target) = self.reference.get() {
            return Some(target);
        }
        if self.resolving.swap(true, Ordering::AcqRel) {
            return None;
        }
        let found = registry.find_and_activate::<C>().ok();
        self.reference.set(registry, found);
        self.resolving.store(false, Ordering::Release);
        self.reference.get()
    }

    pub fn reference(&self) -> &DriverReference<C> {
        &self.reference
    }
}

impl<C: ?Sized + Capability> core::ops::Deref for AutomaticDriverReference<C> {
    type Target = DriverReference<C>;

    fn deref(&self) -> &DriverReference<C> {
        &self.reference
    }
}
