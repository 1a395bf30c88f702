//! Thread registry: which threads exist right now, and what they're called.
//!
//! Rebuilt from `/proc/self/task` on every [`enumerate`] call; the result is
//! consistent with some instant during the call, and threads that appear or
//! disappear concurrently may be included or excluded arbitrarily.

use std::collections::BTreeSet;
use std::io;

/// The current set of thread IDs in this process.
pub fn enumerate() -> io::Result<BTreeSet<u64>> {
    let mut tids = BTreeSet::new();
    for entry in std::fs::read_dir("/proc/self/task")? {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.insert(tid);
        }
    }
    Ok(tids)
}

/// The calling thread's kernel thread ID.
pub fn current_tid() -> u64 {
    // gettid(2) cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Read the thread name from `/proc/self/task/<tid>/comm`.
/// Returns `None` if the thread is gone or the name is empty.
pub fn thread_name(tid: u64) -> Option<String> {
    std::fs::read_to_string(format!("/proc/self/task/{tid}/comm"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_includes_current_thread() {
        let tids = enumerate().unwrap();
        assert!(tids.contains(&current_tid()));
    }

    #[test]
    fn enumerate_sees_a_spawned_thread() {
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            tx.send(current_tid()).unwrap();
            done_rx.recv().unwrap();
        });
        let child_tid = rx.recv().unwrap();
        assert!(enumerate().unwrap().contains(&child_tid));
        done_tx.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn thread_name_of_named_thread() {
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("prof-rec-test".into())
            .spawn(move || {
                tx.send(current_tid()).unwrap();
                done_rx.recv().unwrap();
            })
            .unwrap();
        let child_tid = rx.recv().unwrap();
        assert_eq!(thread_name(child_tid).as_deref(), Some("prof-rec-test"));
        done_tx.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn thread_name_of_bogus_tid_is_none() {
        assert!(thread_name(u64::MAX).is_none());
    }
}
