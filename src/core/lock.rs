use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

const LOCK_RETRY_DELAY: Duration = Duration::from_micros(200);

fn log_poisoned(lock_type: &str, context: &str) {
    log::error!("{} lock poisoned in {}", lock_type, context);
}

pub fn lock_mutex<'a, T>(mutex: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log_poisoned("Mutex", context);
            poisoned.into_inner()
        }
    }
}

pub fn lock_mutex_with_timeout<'a, T>(
    mutex: &'a Mutex<T>,
    context: &str,
    timeout: Duration,
) -> Option<MutexGuard<'a, T>> {
    let start = Instant::now();
    loop {
        match mutex.try_lock() {
            Ok(guard) => return Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => {
                log_poisoned("Mutex", context);
                return Some(poisoned.into_inner());
            }
            Err(TryLockError::WouldBlock) => {
                if start.elapsed() >= timeout {
                    log::warn!("Mutex lock timed out in {}", context);
                    return None;
                }
                std::thread::sleep(LOCK_RETRY_DELAY);
            }
        }
    }
}
