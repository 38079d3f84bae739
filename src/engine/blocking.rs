use tokio::runtime::{Handle, RuntimeFlavor};

/// Runs a closure that may park the current thread.
///
/// On a multi-thread runtime worker the worker's core is handed to another
/// thread for the duration, so the pool keeps its configured number of
/// runnable workers. Anywhere else the closure runs inline.
pub fn managed_block<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
