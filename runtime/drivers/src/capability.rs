//! Driver type tags and capability casts

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::{Any, TypeId};
use core::fmt;
use core::ops::RangeInclusive;

/// A node in the "is-a" chain of driver kinds
///
/// Tags are `static`s and compared by address, so two tags with the same
/// name are still distinct kinds.
pub struct DriverType {
    pub name: &'static str,
    pub description: &'static str,
    pub parent: Option<&'static DriverType>,
}

impl DriverType {
    pub const fn new(
        name: &'static str,
        description: &'static str,
        parent: Option<&'static DriverType>,
    ) -> Self {
        Self {
            name,
            description,
            parent,
        }
    }

    /// True if `candidate` is this tag or any of its ancestors
    pub fn is_type(&self, candidate: &DriverType) -> bool {
        self.lineage().any(|ty| core::ptr::eq(ty, candidate))
    }

    /// This tag followed by each parent up to the root
    pub fn lineage(&self) -> impl Iterator<Item = &DriverType> {
        core::iter::successors(Some(self), |ty| ty.parent)
    }
}

impl fmt::Debug for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

pub static DRIVER: DriverType = DriverType::new("driver", "Driver", None);
pub static HARDWARE: DriverType = DriverType::new("hardware", "Hardware Device", Some(&DRIVER));
pub static SOFTWARE: DriverType = DriverType::new("software", "Software", Some(&DRIVER));
pub static INTERRUPT_CONTROLLER: DriverType =
    DriverType::new("interrupt", "Interrupt Controller", Some(&HARDWARE));
pub static TIMER: DriverType = DriverType::new("timer", "Timer", Some(&HARDWARE));

/// A trait object type the registry can hand out
///
/// `TYPE` gates the lookup: only drivers whose tag chain contains it are
/// asked for the cast.
pub trait Capability: Send + Sync + 'static {
    const TYPE: &'static DriverType;
}

impl Capability for dyn crate::Driver {
    const TYPE: &'static DriverType = &DRIVER;
}

/// Routes hardware IRQ lines to the CPU
pub trait InterruptController: Send + Sync {
    fn irq_range(&self) -> RangeInclusive<u8>;
    fn enable_irq(&self, cpu: u32, irq: u8);
    fn disable_irq(&self, cpu: u32, irq: u8);
}

impl Capability for dyn InterruptController {
    const TYPE: &'static DriverType = &INTERRUPT_CONTROLLER;
}

/// Monotonic clock with a one-shot alarm, in microseconds
pub trait Timer: Send + Sync {
    fn now(&self) -> u64;

    /// Raise the timer IRQ once, `usecs` from now
    fn arm_oneshot(&self, usecs: u64);

    fn disarm(&self);
}

impl Capability for dyn Timer {
    const TYPE: &'static DriverType = &TIMER;
}

/// The trait objects one driver implements
#[derive(Default)]
pub struct Capabilities {
    entries: Vec<(TypeId, Box<dyn Any + Send + Sync>)>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `capability` as an implementation of `C`
    pub fn provide<C: ?Sized + Capability>(&mut self, capability: Arc<C>) {
        let id = TypeId::of::<C>();
        self.entries.retain(|(existing, _)| *existing != id);
        self.entries.push((id, Box::new(capability)));
    }

    pub fn get<C: ?Sized + Capability>(&self) -> Option<Arc<C>> {
        let id = TypeId::of::<C>();
        self.entries
            .iter()
            .find(|(existing, _)| *existing == id)
            .and_then(|(_, cast)| cast.downcast_ref::<Arc<C>>())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static PL011: DriverType = DriverType::new("pl011", "PL011 UART", Some(&HARDWARE));

    struct FixedClock;

    impl Timer for FixedClock {
        fn now(&self) -> u64 {
            42
        }
        fn arm_oneshot(&self, _usecs: u64) {}
        fn disarm(&self) {}
    }

    #[test]
    fn test_type_chain() {
        assert!(PL011.is_type(&PL011));
        assert!(PL011.is_type(&HARDWARE));
        assert!(PL011.is_type(&DRIVER));
        assert!(!PL011.is_type(&SOFTWARE));
        assert!(!HARDWARE.is_type(&PL011));
        assert!(!TIMER.is_type(&INTERRUPT_CONTROLLER));
    }

    #[test]
    fn test_lineage_reaches_root() {
        let names: Vec<_> = TIMER.lineage().map(|ty| ty.name).collect();
        assert_eq!(names, ["timer", "hardware", "driver"]);
    }

    #[test]
    fn test_capability_cast() {
        let mut caps = Capabilities::new();
        assert!(caps.get::<dyn Timer>().is_none());

        caps.provide::<dyn Timer>(Arc::new(FixedClock));
        let timer = caps.get::<dyn Timer>().unwrap();
        assert_eq!(timer.now(), 42);
        assert!(caps.get::<dyn InterruptController>().is_none());

        caps.provide::<dyn Timer>(Arc::new(FixedClock));
        assert_eq!(caps.len(), 1);
    }
}
