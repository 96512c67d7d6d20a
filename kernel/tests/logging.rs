//! The kernel logger as the global `log` backend
//!
//! Only one logger can be installed per process, so this file holds a
//! single test.

mod common;

use common::hosted;
use keel_kernel::hosted::BufferConsole;
use keel_kernel::logger;

static CONSOLE: BufferConsole = BufferConsole::new();

#[test]
fn test_boot_is_logged_to_the_console() {
    logger::init(&CONSOLE).unwrap();
    assert!(logger::init(&CONSOLE).is_err());

    let (context, platform) = hosted();
    context.boot().unwrap();
    let output = CONSOLE.contents();

    assert!(output.contains("[INFO ] keel_drivers::lifecycle: START simPic"));
    assert!(output.contains("START simTimer"));
    assert!(output.contains("START cpuScheduler") || output.contains("START simpleScheduler"));
    assert!(output.contains("[+] simTimer - Simulated One-shot Timer"));
    assert!(output.contains("boot flow running as"));

    // Installs log at debug, below the default level.
    if !cfg!(feature = "log-debug") && !cfg!(feature = "log-trace") {
        assert!(!output.contains("INSTALL"));
    }

    CONSOLE.clear();
    context.registry().stop_driver(platform.timer_id).unwrap();
    let output = CONSOLE.contents();
    assert!(output.contains("STOP simTimer"));
    assert!(output.contains("[ERROR]"));
    assert!(output.contains("Timer dropped"));
}
