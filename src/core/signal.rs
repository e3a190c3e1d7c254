use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use ctrlc;

/// Sets up a Ctrl+C handler that clears the shared `running` flag.
///
/// Every blocking step polls `running`, so Ctrl+C unwinds through the normal
/// cleanup path. The one exception is the device prompt, which blocks on
/// stdin: while it is armed, a second Ctrl+C exits the process.
///
/// # Arguments
///
/// * `running_flag` - Shared flag checked by the scan loop, the pipe wait and the relay loop
/// * `force_exit` - Armed by [`ForceExitGuard`] around blocking stdin reads
///
/// # Errors
///
/// Fails if a handler is already installed for this process
pub fn setup_ctrlc_handler(
    running_flag: Arc<AtomicBool>,
    force_exit: Arc<AtomicBool>,
) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        if on_interrupt(&running_flag, &force_exit) {
            eprintln!("\nForced exit");
            std::process::exit(-1);
        }
    })
}

/// Records one Ctrl+C. Returns `true` when the process should exit at once:
/// the flag was already cleared and a stdin read is in progress.
pub fn on_interrupt(running: &AtomicBool, force_exit: &AtomicBool) -> bool {
    let was_running = running.swap(false, Ordering::SeqCst);
    !was_running && force_exit.load(Ordering::SeqCst)
}

/// Arms the forced exit for as long as it lives.
pub struct ForceExitGuard<'a>(&'a AtomicBool);

impl<'a> ForceExitGuard<'a> {
    pub fn arm(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        ForceExitGuard(flag)
    }
}

impl Drop for ForceExitGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
