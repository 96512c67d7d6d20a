//! Mock drivers shared by the integration tests

#![allow(dead_code)]

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use keel_drivers::*;

pub static MOCK_DEVICE: DriverType = DriverType::new("mockDevice", "Mock Device", Some(&HARDWARE));
pub static MOCK_PIC: DriverType =
    DriverType::new("mockPic", "Mock Interrupt Controller", Some(&INTERRUPT_CONTROLLER));
pub static MOCK_CLOCK: DriverType = DriverType::new("mockClock", "Mock Clock", Some(&TIMER));

/// Configurable device that claims resources from its start hook
pub struct Device {
    pub name: &'static str,
    pub startup: Startup,
    pub memory: Vec<(usize, usize)>,
    pub pci: Vec<PciAddress>,
    pub irqs: Vec<u8>,
    pub vectors: Vec<u8>,
    pub fail_start: bool,
    pub fail_stop: AtomicBool,
    pub stoppable: bool,
    pub restartable: bool,
    pub handles_interrupts: bool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub irq_hits: AtomicUsize,
    pub interrupt_hits: AtomicUsize,
}

impl Device {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            startup: Startup::OnDemand,
            memory: Vec::new(),
            pci: Vec::new(),
            irqs: Vec::new(),
            vectors: Vec::new(),
            fail_start: false,
            fail_stop: AtomicBool::new(false),
            stoppable: true,
            restartable: true,
            handles_interrupts: false,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            irq_hits: AtomicUsize::new(0),
            interrupt_hits: AtomicUsize::new(0),
        }
    }

    pub fn memory(mut self, start: usize, size: usize) -> Self {
        self.memory.push((start, size));
        self
    }

    pub fn pci(mut self, device: PciAddress) -> Self {
        self.pci.push(device);
        self
    }

    pub fn irq(mut self, irq: u8) -> Self {
        self.irqs.push(irq);
        self
    }

    pub fn vector(mut self, vector: u8, handles: bool) -> Self {
        self.vectors.push(vector);
        self.handles_interrupts = handles;
        self
    }

    pub fn startup(mut self, startup: Startup) -> Self {
        self.startup = startup;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn unstoppable(mut self) -> Self {
        self.stoppable = false;
        self.restartable = false;
        self
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Driver for Device {
    fn driver_type(&self) -> &'static DriverType {
        &MOCK_DEVICE
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn startup(&self) -> Startup {
        self.startup
    }

    fn on_start(&self, api: &DriverApi<'_>) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        for (start, size) in &self.memory {
            api.subscribe_memory(*start, *size)?;
        }
        for device in &self.pci {
            api.subscribe_pci(*device)?;
        }
        for irq in &self.irqs {
            api.subscribe_irq(*irq)?;
        }
        for vector in &self.vectors {
            api.subscribe_interrupt(*vector)?;
        }
        if self.fail_start {
            return Err(DriverError::start_failed(self.name, "device not present"));
        }
        Ok(())
    }

    fn on_stop(&self, _api: &DriverApi<'_>) -> Result<()> {
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(DriverError::StopRefused { driver: self.name });
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn can_stop(&self) -> bool {
        self.stoppable
    }

    fn can_restart(&self) -> bool {
        self.restartable
    }

    fn on_irq(&self, _irq: u8) {
        self.irq_hits.fetch_add(1, Ordering::SeqCst);
    }

    fn on_interrupt(&self, _vector: u8) -> bool {
        self.interrupt_hits.fetch_add(1, Ordering::SeqCst);
        self.handles_interrupts
    }
}

/// Interrupt controller that records which lines are unmasked
pub struct Pic {
    pub lines: RangeInclusive<u8>,
    pub enabled: Mutex<Vec<u8>>,
    pub enable_calls: AtomicUsize,
}

impl Pic {
    pub fn new(lines: RangeInclusive<u8>) -> Self {
        Self {
            lines,
            enabled: Mutex::new(Vec::new()),
            enable_calls: AtomicUsize::new(0),
        }
    }

    pub fn enabled(&self) -> Vec<u8> {
        let mut lines = self.enabled.lock().unwrap().clone();
        lines.sort_unstable();
        lines
    }
}

impl Driver for Pic {
    fn driver_type(&self) -> &'static DriverType {
        &MOCK_PIC
    }

    fn on_start(&self, _api: &DriverApi<'_>) -> Result<()> {
        Ok(())
    }

    fn provide(self: Arc<Self>, capabilities: &mut Capabilities) {
        capabilities.provide::<dyn InterruptController>(self);
    }
}

impl InterruptController for Pic {
    fn irq_range(&self) -> RangeInclusive<u8> {
        self.lines.clone()
    }

    fn enable_irq(&self, _cpu: u32, irq: u8) {
        self.enable_calls.fetch_add(1, Ordering::SeqCst);
        let mut enabled = self.enabled.lock().unwrap();
        if !enabled.contains(&irq) {
            enabled.push(irq);
        }
    }

    fn disable_irq(&self, _cpu: u32, irq: u8) {
        self.enabled.lock().unwrap().retain(|line| *line != irq);
    }
}

/// Timer whose start can be made to fail
pub struct Clock {
    pub name: &'static str,
    pub present: bool,
    pub now: AtomicUsize,
}

impl Clock {
    pub fn new(name: &'static str, present: bool) -> Self {
        Self {
            name,
            present,
            now: AtomicUsize::new(0),
        }
    }
}

impl Driver for Clock {
    fn driver_type(&self) -> &'static DriverType {
        &MOCK_CLOCK
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn on_start(&self, _api: &DriverApi<'_>) -> Result<()> {
        if !self.present {
            return Err(DriverError::start_failed(self.name, "no counter"));
        }
        Ok(())
    }

    fn provide(self: Arc<Self>, capabilities: &mut Capabilities) {
        capabilities.provide::<dyn Timer>(self);
    }
}

impl Timer for Clock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst) as u64
    }

    fn arm_oneshot(&self, _usecs: u64) {}

    fn disarm(&self) {}
}
