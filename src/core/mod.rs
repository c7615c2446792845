//! Core runtime components: the message codec, the sensor boundary, the
//! publishing gateway, and the consuming subscriber.

pub mod codec;
pub mod gateway;
pub mod sensors;
pub mod subscriber;

/// Locks a mutex, recovering the guard if a panicking holder poisoned it.
/// Stats counters must stay readable even after a task panic.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
