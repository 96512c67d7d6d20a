use alloc::sync::Arc;

use crate::{Capabilities, DriverApi, DriverType, Result, Startup};

/// A long-lived driver instance
///
/// Hooks receive a [`DriverApi`] bound to this driver; every resource claim
/// goes through it so that the registry can arbitrate. Hooks are always
/// called with the registry unlocked and may activate other drivers.
pub trait Driver: Send + Sync + 'static {
    fn driver_type(&self) -> &'static DriverType;

    fn name(&self) -> &'static str {
        self.driver_type().name
    }

    fn description(&self) -> &'static str {
        self.driver_type().description
    }

    /// Policy recorded in the ledger at install time
    fn startup(&self) -> Startup {
        Startup::OnDemand
    }

    fn on_start(&self, api: &DriverApi<'_>) -> Result<()>;

    fn on_stop(&self, _api: &DriverApi<'_>) -> Result<()> {
        Ok(())
    }

    fn can_stop(&self) -> bool {
        true
    }

    fn can_restart(&self) -> bool {
        true
    }

    /// Hardware IRQ line fired; every subscriber is called
    fn on_irq(&self, _irq: u8) {}

    /// CPU interrupt vector fired; return true if this driver handled it
    fn on_interrupt(&self, _vector: u8) -> bool {
        false
    }

    /// Publish the capability trait objects this driver implements
    fn provide(self: Arc<Self>, _capabilities: &mut Capabilities) {}
}
