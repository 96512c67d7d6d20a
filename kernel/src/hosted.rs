//! Simulated platform for running the kernel on a development host
//!
//! The timer's clock only moves when told to, which makes every scheduling
//! decision reproducible.

use alloc::string::String;
use alloc::sync::Arc;
use core::ops::RangeInclusive;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use keel_drivers::sync::IrqSpinlock;
use keel_drivers::{
    Bitmap256, Capabilities, Driver, DriverApi, DriverId, DriverType, InterruptController,
    Startup, Timer, INTERRUPT_CONTROLLER, TIMER,
};
use log::trace;

use crate::config::KernelScheduler;
use crate::console::Console;
use crate::KernelContext;

pub static SIM_TIMER: DriverType =
    DriverType::new("simTimer", "Simulated One-shot Timer", Some(&TIMER));

pub static SIM_INTERRUPT_CONTROLLER: DriverType = DriverType::new(
    "simPic",
    "Simulated Interrupt Controller",
    Some(&INTERRUPT_CONTROLLER),
);

/// Line the simulated timer raises
pub const SIM_TIMER_IRQ: u8 = 0;

const DISARMED: u64 = u64::MAX;

/// One-shot timer over a manual microsecond clock
pub struct SimTimer {
    now: AtomicU64,
    deadline: AtomicU64,
    fired: AtomicUsize,
}

impl Default for SimTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTimer {
    pub const fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
            deadline: AtomicU64::new(DISARMED),
            fired: AtomicUsize::new(0),
        }
    }

    /// Move the clock forward; true if that crossed the armed deadline
    pub fn advance(&self, usecs: u64) -> bool {
        let now = self.now.fetch_add(usecs, Ordering::SeqCst) + usecs;
        let deadline = self.deadline.load(Ordering::SeqCst);
        deadline != DISARMED
            && now >= deadline
            && self
                .deadline
                .compare_exchange(deadline, DISARMED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    pub fn deadline(&self) -> Option<u64> {
        match self.deadline.load(Ordering::SeqCst) {
            DISARMED => None,
            deadline => Some(deadline),
        }
    }

    /// Timer interrupts delivered so far
    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Timer for SimTimer {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn arm_oneshot(&self, usecs: u64) {
        let deadline = self.now().saturating_add(usecs).min(DISARMED - 1);
        self.deadline.store(deadline, Ordering::SeqCst);
    }

    fn disarm(&self) {
        self.deadline.store(DISARMED, Ordering::SeqCst);
    }
}

impl Driver for SimTimer {
    fn driver_type(&self) -> &'static DriverType {
        &SIM_TIMER
    }

    fn on_start(&self, api: &DriverApi<'_>) -> keel_drivers::Result<()> {
        api.subscribe_irq(SIM_TIMER_IRQ)
    }

    fn on_stop(&self, _api: &DriverApi<'_>) -> keel_drivers::Result<()> {
        self.disarm();
        Ok(())
    }

    fn on_irq(&self, irq: u8) {
        if irq == SIM_TIMER_IRQ {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn provide(self: Arc<Self>, capabilities: &mut Capabilities) {
        capabilities.provide::<dyn Timer>(self);
    }
}

/// Sixteen-line interrupt controller that only records which lines are on
#[derive(Default)]
pub struct SimInterruptController {
    enabled: IrqSpinlock<Bitmap256>,
}

impl SimInterruptController {
    pub fn is_enabled(&self, irq: u8) -> bool {
        self.enabled.lock().get(irq)
    }
}

impl InterruptController for SimInterruptController {
    fn irq_range(&self) -> RangeInclusive<u8> {
        0..=15
    }

    fn enable_irq(&self, cpu: u32, irq: u8) {
        trace!("cpu{}: enable IRQ {}", cpu, irq);
        self.enabled.lock().set(irq, true);
    }

    fn disable_irq(&self, cpu: u32, irq: u8) {
        trace!("cpu{}: disable IRQ {}", cpu, irq);
        self.enabled.lock().set(irq, false);
    }
}

impl Driver for SimInterruptController {
    fn driver_type(&self) -> &'static DriverType {
        &SIM_INTERRUPT_CONTROLLER
    }

    fn startup(&self) -> Startup {
        Startup::Automatic
    }

    fn on_start(&self, _api: &DriverApi<'_>) -> keel_drivers::Result<()> {
        Ok(())
    }

    fn provide(self: Arc<Self>, capabilities: &mut Capabilities) {
        capabilities.provide::<dyn InterruptController>(self);
    }
}

/// Console that keeps everything written to it
#[derive(Default)]
pub struct BufferConsole {
    text: IrqSpinlock<String>,
}

impl BufferConsole {
    pub const fn new() -> Self {
        Self {
            text: IrqSpinlock::new(String::new()),
        }
    }

    pub fn contents(&self) -> String {
        self.text.lock().clone()
    }

    pub fn clear(&self) {
        self.text.lock().clear();
    }
}

impl Console for BufferConsole {
    fn putc(&self, c: u8) {
        self.text.lock().push(c as char);
    }

    fn puts(&self, s: &str) {
        self.text.lock().push_str(s);
    }
}

/// Drivers installed by [`install_platform`]
pub struct Platform {
    pub timer: Arc<SimTimer>,
    pub timer_id: DriverId,
    pub interrupt_controller: Arc<SimInterruptController>,
    pub interrupt_controller_id: DriverId,
    pub scheduler: Arc<KernelScheduler>,
    pub scheduler_id: DriverId,
}

impl Platform {
    /// Advance the clock, delivering the timer interrupt if it fires
    pub fn tick(&self, context: &KernelContext, usecs: u64) -> bool {
        if !self.timer.advance(usecs) {
            return false;
        }
        context.on_irq(SIM_TIMER_IRQ);
        context.on_timer_interrupt();
        true
    }
}

/// Install the simulated interrupt controller, timer and the configured
/// scheduler
pub fn install_platform(context: &KernelContext) -> Platform {
    let interrupt_controller = Arc::new(SimInterruptController::default());
    let interrupt_controller_id = context.install(interrupt_controller.clone());
    let timer = Arc::new(SimTimer::new());
    let timer_id = context.install(timer.clone());
    let (scheduler_id, scheduler) = context.install_scheduler();
    Platform {
        timer,
        timer_id,
        interrupt_controller,
        interrupt_controller_id,
        scheduler,
        scheduler_id,
    }
}
