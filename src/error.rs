use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while sampling, symbolizing, or rendering.
///
/// Per-thread failures (`ThreadGone`, `StuckThread`, `AlreadyMe`) are handled
/// inside a sampling round by recording an empty-stack sample; they only
/// surface to callers using the stopper directly. Everything marked "fatal"
/// below aborts the session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Fatal: the sampling engine only works on Linux (x86_64, aarch64).
    #[error("sampling is not supported on this platform")]
    UnsupportedPlatform,

    /// Fatal: `sigaction` for the reserved realtime signal failed.
    #[error("failed to install the profiling signal handler: {0}")]
    HandlerInstall(#[source] io::Error),

    /// The thread exited before it could be suspended.
    #[error("thread {0} is gone")]
    ThreadGone(u64),

    /// The thread did not enter the signal handler within the stop timeout.
    #[error("thread {0} did not reach the signal handler in time")]
    StuckThread(u64),

    /// A thread cannot suspend itself.
    #[error("cannot suspend the calling thread ({0})")]
    AlreadyMe(u64),

    #[error("failed to signal thread {tid}: {source}")]
    SignalDelivery {
        tid: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to enumerate threads: {0}")]
    ThreadList(#[source] io::Error),

    #[error("failed to snapshot process mappings: {0}")]
    Maps(#[source] io::Error),

    /// Fatal for the session; the partial spool is retained for debugging.
    #[error("spool I/O failed: {0}")]
    Spool(#[source] io::Error),

    /// Per-query: the caller receives a synthesized "unknown" frame instead.
    #[error("symbolizer backend failed: {0}")]
    Backend(String),

    /// Per-query: the backend did not answer within the query timeout.
    #[error("symbolizer backend timed out")]
    BackendTimeout,

    /// Fatal for the session.
    #[error("renderer failed: {0}")]
    Render(#[source] io::Error),

    #[error("output sink failed: {0}")]
    Sink(#[source] io::Error),

    #[error("invalid interval {0:?}")]
    InvalidInterval(String),

    #[error("invalid server url {0:?}")]
    InvalidServerUrl(String),

    #[error("operation cancelled")]
    Cancelled,
}
