//! Fire-and-forget work on a named thread whose result always reaches the
//! caller, even when no thread can be spawned.

use std::io;
use std::sync::{Arc, Mutex};

type Spawned = Box<dyn FnOnce() + Send + 'static>;

/// Run `work` on a new thread named `name` and pass its result to
/// `on_done` there. If the thread cannot be spawned, `on_done` runs on the
/// caller's thread with `on_spawn_error`'s value instead.
pub(crate) fn detach<T, W, D, E>(name: &str, work: W, on_done: D, on_spawn_error: E)
where
    W: FnOnce() -> T + Send + 'static,
    D: FnOnce(T) + Send + 'static,
    E: FnOnce(io::Error) -> T,
{
    let builder = std::thread::Builder::new().name(name.to_string());
    detach_with(name, |job| builder.spawn(job).map(drop), work, on_done, on_spawn_error);
}

fn detach_with<T, S, W, D, E>(name: &str, spawn: S, work: W, on_done: D, on_spawn_error: E)
where
    S: FnOnce(Spawned) -> io::Result<()>,
    W: FnOnce() -> T + Send + 'static,
    D: FnOnce(T) + Send + 'static,
    E: FnOnce(io::Error) -> T,
{
    let slot = Arc::new(Mutex::new(Some(on_done)));
    let theirs = Arc::clone(&slot);
    let job: Spawned = Box::new(move || {
        let out = work();
        if let Some(done) = theirs.lock().unwrap().take() {
            done(out);
        }
    });
    if let Err(e) = spawn(job) {
        tracing::error!(thread = name, error = %e, "failed to spawn thread");
        let done = slot.lock().unwrap().take();
        if let Some(done) = done {
            done(on_spawn_error(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn result_arrives_from_worker_thread() {
        let (tx, rx) = mpsc::channel();
        detach(
            "detach-test",
            || std::thread::current().name().map(str::to_string),
            move |name| tx.send(name).unwrap(),
            |_| None,
        );
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("detach-test"));
    }

    #[test]
    fn spawn_failure_still_completes() {
        let (tx, rx) = mpsc::channel();
        detach_with(
            "never",
            |_job| Err(io::Error::new(io::ErrorKind::WouldBlock, "thread limit")),
            || Ok::<u32, String>(7),
            move |out| tx.send(out).unwrap(),
            |e| Err(e.to_string()),
        );
        assert_eq!(rx.try_recv().unwrap(), Err("thread limit".to_string()));
    }
}
