pub use self::spin_lock::{SpinLock, SpinLockGuard};

mod spin_lock;
