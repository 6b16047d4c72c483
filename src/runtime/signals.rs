//! Process signal handling for a running pool.
//!
//! SIGINT and SIGTERM are caught by `signal-hook`, whose handler only writes
//! to a self-pipe. A listener thread reads that pipe and turns each signal
//! into delivery of the pool's interrupt message through the hub, so no pool
//! logic ever runs in signal-handler context.
//!
//! signal-hook keeps its own handler installed for the rest of the process.
//! Once no pool is running, a conditional action registered next to it
//! emulates the default disposition, so SIGINT/SIGTERM terminate the process
//! again as they did before `run`.
//!
//! SIGSEGV gets a raw `sigaction` handler (signal-hook refuses to hook it).
//! The handler formats the faulting address into a stack buffer, writes it
//! to stderr and aborts. It neither allocates nor locks.

use super::pool::PoolHandle;
use parking_lot::Mutex;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

const INTERRUPT_SIGNALS: [libc::c_int; 2] = [SIGINT, SIGTERM];

/// Keeps signal handling installed; dropping it tears everything down.
pub(crate) struct SignalGuard {
    handle: Handle,
    listener: Option<JoinHandle<()>>,
    _process: ProcessHandlers,
}

impl SignalGuard {
    pub fn install(pool: PoolHandle) -> io::Result<Self> {
        let process = ProcessHandlers::install()?;
        let mut signals = Signals::new(INTERRUPT_SIGNALS)?;
        let handle = signals.handle();

        let listener = thread::Builder::new()
            .name("pool-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    info!(signal, "Interrupt signal received");
                    pool.deliver_interrupt();
                }
                debug!("Signal listener exiting");
            })?;

        Ok(Self {
            handle,
            listener: Some(listener),
            _process: process,
        })
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(listener) = self.listener.take() {
            if listener.join().is_err() {
                error!("Signal listener panicked");
            }
        }
    }
}

struct ProcessState {
    installs: usize,
    previous_segv: Option<libc::sigaction>,
    /// Set while no pool is running: SIGINT/SIGTERM take their default action.
    default_interrupts: Option<Arc<AtomicBool>>,
}

static PROCESS_STATE: Mutex<ProcessState> = parking_lot::const_mutex(ProcessState {
    installs: 0,
    previous_segv: None,
    default_interrupts: None,
});

/// Reference-counted process-wide handlers. The first guard installs the
/// SIGSEGV handler and suspends the default SIGINT/SIGTERM action; the last
/// one dropped restores both.
struct ProcessHandlers;

impl ProcessHandlers {
    fn install() -> io::Result<Self> {
        let mut state = PROCESS_STATE.lock();
        if state.installs == 0 {
            // SAFETY: the handler only calls async-signal-safe functions.
            let previous = unsafe {
                let mut action: libc::sigaction = mem::zeroed();
                action.sa_sigaction = segv_handler as usize;
                action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
                libc::sigemptyset(&mut action.sa_mask);

                let mut previous: libc::sigaction = mem::zeroed();
                if libc::sigaction(libc::SIGSEGV, &action, &mut previous) != 0 {
                    return Err(io::Error::last_os_error());
                }
                previous
            };
            state.previous_segv = Some(previous);

            match &state.default_interrupts {
                Some(flag) => flag.store(false, Ordering::SeqCst),
                None => {
                    let flag = Arc::new(AtomicBool::new(false));
                    for signal in INTERRUPT_SIGNALS {
                        signal_hook::flag::register_conditional_default(signal, Arc::clone(&flag))?;
                    }
                    state.default_interrupts = Some(flag);
                }
            }
        }
        state.installs += 1;
        Ok(ProcessHandlers)
    }
}

impl Drop for ProcessHandlers {
    fn drop(&mut self) {
        let mut state = PROCESS_STATE.lock();
        state.installs -= 1;
        if state.installs == 0 {
            if let Some(previous) = state.previous_segv.take() {
                // SAFETY: restoring a disposition obtained from sigaction.
                let rc = unsafe { libc::sigaction(libc::SIGSEGV, &previous, std::ptr::null_mut()) };
                if rc != 0 {
                    error!(error = %io::Error::last_os_error(), "Failed to restore SIGSEGV handler");
                }
            }
            if let Some(flag) = &state.default_interrupts {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }
}

extern "C" fn segv_handler(_signal: libc::c_int, info: *mut libc::siginfo_t, _ucontext: *mut libc::c_void) {
    let addr = if info.is_null() {
        0
    } else {
        // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
        unsafe { fault_address(&*info) }
    };

    let mut buf = [0u8; 96];
    let len = format_fault(&mut buf, addr);
    // SAFETY: write(2) and abort(3) are async-signal-safe.
    unsafe {
        libc::write(libc::STDERR_FILENO, buf.as_ptr().cast(), len);
        libc::abort();
    }
}

#[cfg(target_os = "linux")]
unsafe fn fault_address(info: &libc::siginfo_t) -> usize {
    info.si_addr() as usize
}

#[cfg(not(target_os = "linux"))]
unsafe fn fault_address(info: &libc::siginfo_t) -> usize {
    info.si_addr as usize
}

/// Write the crash line for a fault at `addr` into `buf` without allocating.
/// Returns the number of bytes written.
fn format_fault(buf: &mut [u8; 96], addr: usize) -> usize {
    const PREFIX: &[u8] = b"coropool: segmentation fault at 0x";
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let mut len = PREFIX.len();
    buf[..len].copy_from_slice(PREFIX);

    let mut digits = [0u8; 16];
    let mut n = 0;
    let mut rest = addr;
    loop {
        digits[n] = HEX[rest & 0xf];
        n += 1;
        rest >>= 4;
        if rest == 0 {
            break;
        }
    }
    for &digit in digits[..n].iter().rev() {
        buf[len] = digit;
        len += 1;
    }

    buf[len] = b'\n';
    len + 1
}


/// Serializes tests that install process-wide signal handlers.
#[cfg(test)]
pub(crate) static SIGNAL_TESTS: Mutex<()> = parking_lot::const_mutex(());
