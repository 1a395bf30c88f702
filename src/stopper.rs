//! Thread stopper: suspend one thread with a directed realtime signal, hand
//! its machine context to a closure, then release it.
//!
//! The signal handler is strictly async-signal-safe: it touches a single
//! static fixed-size slot through atomics, reads its own tid with a raw
//! syscall, and parks on `sched_yield` until released. No heap, no locks, no
//! I/O. The stopper side serializes stops with one coarse mutex held outside
//! signal context, so the handler only ever races with exactly one stopper.
//!
//! State machine of one stop:
//! `idle → signalled → captured → (stopper walks) → release → idle`.

use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::threads;

/// Watchdog for a single stop: how long the target thread gets to reach the
/// signal handler before the stop is abandoned.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(250);

/// Registers captured from a suspended thread, enough to start a
/// frame-pointer walk.
#[derive(Debug, Clone, Copy)]
pub struct ThreadContext {
    pub ip: u64,
    pub sp: u64,
    pub fp: u64,
}

const STATE_IDLE: u32 = 0;
const STATE_SIGNALLED: u32 = 1;
const STATE_CAPTURED: u32 = 2;
const STATE_RELEASE: u32 = 3;

/// The single stop slot shared with the signal handler. Static and
/// fixed-size; the handler never allocates.
struct StopSlot {
    state: AtomicU32,
    target_tid: AtomicU64,
    ip: AtomicU64,
    sp: AtomicU64,
    fp: AtomicU64,
}

static SLOT: StopSlot = StopSlot {
    state: AtomicU32::new(STATE_IDLE),
    target_tid: AtomicU64::new(0),
    ip: AtomicU64::new(0),
    sp: AtomicU64::new(0),
    fp: AtomicU64::new(0),
};

/// Serializes stops process-wide. Held for the whole
/// signalled→release window, never from signal context.
static STOP_LOCK: Mutex<()> = Mutex::new(());

/// The realtime signal reserved for the profiler. The design assumes
/// exclusive ownership; embedders that install their own handler for it are
/// on their own.
#[cfg(target_os = "linux")]
pub fn profiling_signal() -> libc::c_int {
    libc::SIGRTMIN() + 6
}

#[cfg(target_os = "linux")]
static HANDLER_INSTALLED: std::sync::OnceLock<std::result::Result<(), i32>> =
    std::sync::OnceLock::new();

/// Install the signal handler once per process. Fatal if it fails.
#[cfg(target_os = "linux")]
pub fn ensure_handler() -> Result<()> {
    let installed = HANDLER_INSTALLED.get_or_init(|| {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(profiling_signal(), &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error().raw_os_error().unwrap_or(0));
            }
        }
        Ok(())
    });
    installed
        .map_err(|errno| Error::HandlerInstall(io::Error::from_raw_os_error(errno)))
}

#[cfg(not(target_os = "linux"))]
pub fn ensure_handler() -> Result<()> {
    Err(Error::UnsupportedPlatform)
}

/// Signal handler body. Runs on the target thread.
///
/// Claims the slot only if this thread is the one currently being stopped
/// (stale queued signals from abandoned stops fail the tid or CAS check and
/// return immediately), publishes the interrupted registers, then parks
/// until the stopper posts the release.
#[cfg(target_os = "linux")]
extern "C" fn handler(_sig: libc::c_int, _info: *mut libc::siginfo_t, ucontext: *mut libc::c_void) {
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as u64;
    if SLOT.target_tid.load(Ordering::Acquire) != tid {
        return;
    }
    let Some(ctx) = registers_from_ucontext(ucontext) else {
        return;
    };
    SLOT.ip.store(ctx.ip, Ordering::Relaxed);
    SLOT.sp.store(ctx.sp, Ordering::Relaxed);
    SLOT.fp.store(ctx.fp, Ordering::Relaxed);
    if SLOT
        .state
        .compare_exchange(
            STATE_SIGNALLED,
            STATE_CAPTURED,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        // The stopper gave up on us, or this is a stale queued signal.
        return;
    }
    while SLOT.state.load(Ordering::Acquire) != STATE_RELEASE {
        unsafe {
            libc::sched_yield();
        }
    }
    SLOT.state.store(STATE_IDLE, Ordering::Release);
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn registers_from_ucontext(ucontext: *mut libc::c_void) -> Option<ThreadContext> {
    if ucontext.is_null() {
        return None;
    }
    let uc = unsafe { &*(ucontext as *const libc::ucontext_t) };
    let gregs = &uc.uc_mcontext.gregs;
    Some(ThreadContext {
        ip: gregs[libc::REG_RIP as usize] as u64,
        sp: gregs[libc::REG_RSP as usize] as u64,
        fp: gregs[libc::REG_RBP as usize] as u64,
    })
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn registers_from_ucontext(ucontext: *mut libc::c_void) -> Option<ThreadContext> {
    if ucontext.is_null() {
        return None;
    }
    let uc = unsafe { &*(ucontext as *const libc::ucontext_t) };
    Some(ThreadContext {
        ip: uc.uc_mcontext.pc,
        sp: uc.uc_mcontext.sp,
        fp: uc.uc_mcontext.regs[29],
    })
}

#[cfg(all(target_os = "linux", not(any(target_arch = "x86_64", target_arch = "aarch64"))))]
fn registers_from_ucontext(_ucontext: *mut libc::c_void) -> Option<ThreadContext> {
    None
}

/// Suspend `tid`, invoke `f` with its captured machine context, resume it.
///
/// Fails with [`Error::ThreadGone`] if the thread died before suspension,
/// [`Error::StuckThread`] if it did not reach the handler within `timeout`,
/// and [`Error::AlreadyMe`] if `tid` is the calling thread. In every return
/// path the target thread is running again (or was never stopped).
#[cfg(target_os = "linux")]
pub fn with_thread_paused<R>(
    tid: u64,
    timeout: Duration,
    f: impl FnOnce(&ThreadContext) -> R,
) -> Result<R> {
    ensure_handler()?;
    if tid == threads::current_tid() {
        return Err(Error::AlreadyMe(tid));
    }

    let _guard = STOP_LOCK.lock().unwrap();
    // In-core invariant: holding the stop lock means the slot is free.
    assert_eq!(
        SLOT.state.load(Ordering::Acquire),
        STATE_IDLE,
        "stop slot occupied while the stop lock is held"
    );

    SLOT.target_tid.store(tid, Ordering::Release);
    SLOT.state.store(STATE_SIGNALLED, Ordering::Release);

    let rc = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            libc::getpid(),
            tid as libc::pid_t,
            profiling_signal(),
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        // No signal was queued; safe to reset directly.
        SLOT.state.store(STATE_IDLE, Ordering::Release);
        return Err(match err.raw_os_error() {
            Some(libc::ESRCH) => Error::ThreadGone(tid),
            _ => Error::SignalDelivery { tid, source: err },
        });
    }

    let deadline = Instant::now() + timeout;
    loop {
        match SLOT.state.load(Ordering::Acquire) {
            STATE_CAPTURED => break,
            _ if Instant::now() >= deadline => {
                if SLOT
                    .state
                    .compare_exchange(
                        STATE_SIGNALLED,
                        STATE_IDLE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    // A late delivery now fails the handler's CAS and
                    // returns without parking.
                    return Err(Error::StuckThread(tid));
                }
                // Lost the race to a concurrent capture: proceed with it.
            }
            // Yield, don't spin: on a single CPU the target thread needs
            // the core to reach its handler at all.
            _ => std::thread::yield_now(),
        }
    }

    let ctx = ThreadContext {
        ip: SLOT.ip.load(Ordering::Relaxed),
        sp: SLOT.sp.load(Ordering::Relaxed),
        fp: SLOT.fp.load(Ordering::Relaxed),
    };
    let result = f(&ctx);

    SLOT.state.store(STATE_RELEASE, Ordering::Release);
    // Wait for the handler's ack so the thread is never left suspended and
    // the next stop finds the slot idle.
    while SLOT.state.load(Ordering::Acquire) != STATE_IDLE {
        std::thread::yield_now();
    }

    Ok(result)
}

#[cfg(not(target_os = "linux"))]
pub fn with_thread_paused<R>(
    _tid: u64,
    _timeout: Duration,
    _f: impl FnOnce(&ThreadContext) -> R,
) -> Result<R> {
    Err(Error::UnsupportedPlatform)
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// A thread that parks itself until told to stop, reporting its tid.
    fn parked_thread() -> (u64, Arc<AtomicBool>, std::thread::JoinHandle<()>) {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            tx.send(threads::current_tid()).unwrap();
            while !stop2.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        (rx.recv().unwrap(), stop, handle)
    }

    #[test]
    fn captures_a_live_context() {
        let (tid, stop, handle) = parked_thread();
        let ctx = with_thread_paused(tid, DEFAULT_STOP_TIMEOUT, |ctx| *ctx).unwrap();
        assert_ne!(ctx.ip, 0);
        assert_ne!(ctx.sp, 0);
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn refuses_to_stop_self() {
        let err = with_thread_paused(threads::current_tid(), DEFAULT_STOP_TIMEOUT, |_| ())
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyMe(_)));
    }

    #[test]
    fn dead_tid_is_thread_gone() {
        // A tid far beyond any default pid_max.
        let err = with_thread_paused(0x3bff_ffff, DEFAULT_STOP_TIMEOUT, |_| ()).unwrap_err();
        assert!(matches!(err, Error::ThreadGone(_)));
    }

    #[test]
    fn at_most_one_stop_in_flight() {
        let (tid, stop, handle) = parked_thread();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let stoppers: Vec<_> = (0..8)
            .map(|_| {
                let in_flight = in_flight.clone();
                let overlaps = overlaps.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let _ = with_thread_paused(tid, DEFAULT_STOP_TIMEOUT, |_| {
                            if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            std::thread::sleep(Duration::from_micros(200));
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for s in stoppers {
            s.join().unwrap();
        }

        assert_eq!(
            overlaps.load(Ordering::SeqCst),
            0,
            "two stops were in flight at once"
        );
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn target_resumes_after_stop() {
        let (tid, stop, handle) = parked_thread();
        for _ in 0..50 {
            with_thread_paused(tid, DEFAULT_STOP_TIMEOUT, |_| ()).unwrap();
        }
        // The worker must still be responsive after repeated stops.
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
