//! Shared test utilities for serialising environment mutation.

use std::env;
use std::ffi::OsString;

use tokio::sync::{Mutex, MutexGuard};

pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores touched variables on drop.
pub struct EnvGuard {
    saved: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Takes the global env mutex without touching anything yet.
    pub async fn lock() -> Self {
        Self {
            saved: Vec::new(),
            _guard: ENV_LOCK.lock().await,
        }
    }

    /// Sets `key` until the guard drops.
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.remember(key);
        unsafe { env::set_var(key, value) };
        self
    }

    /// Unsets `key` until the guard drops.
    pub fn remove(mut self, key: &str) -> Self {
        self.remember(key);
        unsafe { env::remove_var(key) };
        self
    }

    fn remember(&mut self, key: &str) {
        self.saved.push((key.to_owned(), env::var_os(key)));
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in self.saved.iter().rev() {
            match value {
                Some(previous) => unsafe { env::set_var(key, previous) },
                None => unsafe { env::remove_var(key) },
            }
        }
    }
}
