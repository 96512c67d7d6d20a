//! Driver lifecycle: start, stop, restart and fail
//!
//! ```text
//!              start ok
//!  Inactive ───────────▶ Active ──stop──▶ Inactive
//!     │                    │
//!     │ start err          │ fail_driver
//!     ▼                    ▼
//!   Failed ◀───────────────┘      (restart/start leaves Failed)
//! ```
//!
//! Leaving `Active` by any path releases every resource category and
//! terminates every outstanding [`DriverReference`](crate::DriverReference)
//! on the driver.

use alloc::string::ToString;
use alloc::sync::Weak;
use alloc::vec::Vec;
use log::{error, info, warn};

use crate::reference::Terminate;
use crate::registry::{DriverEvent, DriverId, Registry};
use crate::{Bitmap256, DriverApi, DriverError, LifecycleState, ResourceKinds, Result};

impl Registry {
    /// Run the driver's start hook; no-op if it is already active
    ///
    /// A hook error leaves the driver `Failed` with everything it claimed
    /// released, and is returned as [`DriverError::StartFailed`].
    pub fn start_driver(&self, id: DriverId) -> Result<()> {
        let driver = {
            let mut inner = self.inner.lock();
            let entry = inner.entry_mut(id)?;
            if entry.ledger.is_active() {
                return Ok(());
            }
            if entry.ledger.starting {
                return Err(DriverError::start_failed(
                    entry.driver.name(),
                    "start already in progress",
                ));
            }
            entry.ledger.starting = true;
            entry.ledger.state = LifecycleState::Inactive;
            entry.driver.clone()
        };

        info!("START {}", driver.name());
        let outcome = driver.on_start(&DriverApi::new(self, id));

        let mut inner = self.inner.lock();
        let ledger = &mut inner.entries[id.index()].ledger;
        ledger.starting = false;

        // fail_driver() ran inside the hook and has already cleaned up.
        if ledger.state == LifecycleState::Failed {
            return Err(DriverError::start_failed(driver.name(), "failed while starting"));
        }

        match outcome {
            Ok(()) => {
                ledger.state = LifecycleState::Active;
                let subscribed = inner.subscribed_irqs();
                drop(inner);
                self.route_to_controller(id, &subscribed);
                self.emit(&DriverEvent::Started(id));
                Ok(())
            }
            Err(err) => {
                let err = match err {
                    failed @ DriverError::StartFailed { .. } => failed,
                    other => DriverError::start_failed(driver.name(), other.to_string()),
                };
                ledger.state = LifecycleState::Failed;
                let orphaned = inner.release(id, ResourceKinds::all());
                let references = core::mem::take(&mut inner.entries[id.index()].references);
                drop(inner);

                warn!("{}", err);
                let reason = err.to_string();
                self.finish_departure(id, Some(&reason), &orphaned, references);
                Err(err)
            }
        }
    }

    /// Run the driver's stop hook; no-op if it is not active
    ///
    /// If the hook fails the driver stays active and the error is returned.
    pub fn stop_driver(&self, id: DriverId) -> Result<()> {
        let driver = {
            let inner = self.inner.lock();
            let entry = inner.entry(id)?;
            if !entry.ledger.is_active() {
                return Ok(());
            }
            entry.driver.clone()
        };

        if !driver.can_stop() {
            return Err(DriverError::StopRefused {
                driver: driver.name(),
            });
        }

        info!("STOP {}", driver.name());
        if let Err(err) = driver.on_stop(&DriverApi::new(self, id)) {
            error!("Unable to stop {}: {}", driver.name(), err);
            return Err(err);
        }

        let (orphaned, references) = {
            let mut inner = self.inner.lock();
            inner.entries[id.index()].ledger.state = LifecycleState::Inactive;
            let orphaned = inner.release(id, ResourceKinds::all());
            let references = core::mem::take(&mut inner.entries[id.index()].references);
            (orphaned, references)
        };
        self.finish_departure(id, None, &orphaned, references);
        Ok(())
    }

    /// Stop then start; a driver that is not active is simply started
    pub fn restart_driver(&self, id: DriverId) -> Result<()> {
        let (active, driver) = {
            let inner = self.inner.lock();
            let entry = inner.entry(id)?;
            (entry.ledger.is_active(), entry.driver.clone())
        };

        if !active {
            return self.start_driver(id);
        }
        if !driver.can_restart() {
            return Err(DriverError::StopRefused {
                driver: driver.name(),
            });
        }

        info!("RESTART {}", driver.name());
        self.stop_driver(id)?;
        self.start_driver(id)
    }

    /// Force a driver into `Failed` without calling its stop hook
    ///
    /// Used when a driver can no longer operate, e.g. a dependency vanished.
    /// Always releases every resource the driver held.
    pub fn fail_driver(&self, id: DriverId, reason: &str) {
        let (name, orphaned, references) = {
            let mut inner = self.inner.lock();
            let Ok(entry) = inner.entry_mut(id) else {
                return;
            };
            let name = entry.driver.name();
            entry.ledger.state = LifecycleState::Failed;
            let references = core::mem::take(&mut entry.references);
            let orphaned = inner.release(id, ResourceKinds::all());
            (name, orphaned, references)
        };

        error!("FAIL {}: {}", name, reason);
        self.finish_departure(id, Some(reason), &orphaned, references);
    }

    fn finish_departure(
        &self,
        id: DriverId,
        reason: Option<&str>,
        orphaned: &Bitmap256,
        references: Vec<Weak<dyn Terminate>>,
    ) {
        self.route_irqs(orphaned, false);
        self.emit(&DriverEvent::Stopped { id, reason });
        for reference in references {
            if let Some(reference) = reference.upgrade() {
                reference.terminate(self, id);
            }
        }
    }
}
