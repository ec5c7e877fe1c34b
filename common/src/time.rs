//! Time-related types.
//!
//! Endpoints carry their advertised time as a [`Timestamp`], the same
//! 32-bit seconds-since-epoch representation used on the wire and on
//! disk. Everything the managers compute locally uses [`LocalTime`].
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since epoch, as advertised by peers. This is the wire and
/// disk representation of endpoint times.
pub type Timestamp = u32;

/// Clock that tells the time.
pub trait Clock: Clone {
    /// Return the local time as seconds since epoch.
    /// This is the same representation as used in advertised endpoint
    /// timestamps.
    fn timestamp(&self) -> Timestamp;
    /// Tell the time in local time.
    fn local_time(&self) -> LocalTime;
    /// Create a clock from a timestamp.
    fn from_timestamp(t: Timestamp) -> Self;
}

impl Clock for LocalTime {
    fn timestamp(&self) -> Timestamp {
        self.as_secs() as Timestamp
    }

    fn local_time(&self) -> LocalTime {
        *self
    }

    fn from_timestamp(t: Timestamp) -> Self {
        LocalTime::from_secs(t as u64)
    }
}

/// Clock with interior mutability.
#[derive(Debug, Clone)]
pub struct RefClock<T: Clock> {
    inner: Rc<RefCell<T>>,
}

impl RefClock<LocalTime> {
    /// Elapse time.
    pub fn elapse(&self, duration: LocalDuration) {
        self.inner.borrow_mut().elapse(duration)
    }
}

impl<T: Clock> From<T> for RefClock<T> {
    fn from(other: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(other)),
        }
    }
}

impl<T: Clock> Clock for RefClock<T> {
    fn timestamp(&self) -> Timestamp {
        self.inner.borrow().timestamp()
    }

    fn local_time(&self) -> LocalTime {
        self.inner.borrow().local_time()
    }

    fn from_timestamp(t: Timestamp) -> Self {
        RefClock::from(T::from_timestamp(t))
    }
}

/// Local time.
///
/// This clock is monotonic.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default)]
pub struct LocalTime {
    /// Milliseconds since Epoch.
    millis: u128,
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_secs())
    }
}

impl LocalTime {
    /// Construct a local time from the current system time.
    pub fn now() -> Self {
        static LAST: atomic::AtomicU64 = atomic::AtomicU64::new(0);

        let now = Self::from(SystemTime::now()).as_secs();
        let last = LAST.load(atomic::Ordering::SeqCst);

        // If the current time is in the past, return the last recorded time instead.
        if now < last {
            Self::from_secs(last)
        } else {
            LAST.store(now, atomic::Ordering::SeqCst);
            LocalTime::from_secs(now)
        }
    }

    /// Construct a local time from whole seconds since Epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            millis: secs as u128 * 1000,
        }
    }

    /// Construct a local time from an advertised timestamp.
    pub const fn from_timestamp(t: Timestamp) -> Self {
        Self::from_secs(t as u64)
    }

    /// Convert a local time to whole seconds since Epoch.
    pub fn as_secs(&self) -> u64 {
        (self.millis / 1000) as u64
    }

    /// Elapse time.
    ///
    /// Adds the given duration to the time.
    pub fn elapse(&mut self, duration: LocalDuration) {
        self.millis += duration.as_millis()
    }
}

/// Convert a `SystemTime` into a local time.
impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        let millis = system.duration_since(UNIX_EPOCH).unwrap().as_millis();

        Self { millis }
    }
}

/// Substract two local times. Yields a duration.
impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(other.millis))
    }
}

/// Substract a duration from a local time. Yields a local time.
impl std::ops::Sub<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn sub(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis.saturating_sub(other.0),
        }
    }
}

/// Add a duration to a local time. Yields a local time.
impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis + other.0,
        }
    }
}

/// Time duration as measured locally.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Default)]
pub struct LocalDuration(u128);

impl LocalDuration {
    /// Maximum duration.
    pub const MAX: LocalDuration = LocalDuration(u128::MAX);

    /// Create a new duration from whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs as u128 * 1000)
    }

    /// Create a new duration from whole minutes.
    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    /// Create a new duration from whole hours.
    pub const fn from_hours(hours: u64) -> Self {
        Self::from_mins(hours * 60)
    }

    /// Create a new duration from whole days.
    pub const fn from_days(days: u64) -> Self {
        Self::from_hours(days * 24)
    }

    /// Construct a new duration from milliseconds.
    pub const fn from_millis(millis: u128) -> Self {
        Self(millis)
    }

    /// Return the number of minutes in this duration.
    pub const fn as_mins(&self) -> u64 {
        self.as_secs() / 60
    }

    /// Return the number of seconds in this duration.
    pub const fn as_secs(&self) -> u64 {
        (self.0 / 1000) as u64
    }

    /// Return the number of milliseconds in this duration.
    pub const fn as_millis(&self) -> u128 {
        self.0
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 < 1000 {
            write!(f, "{} millisecond(s)", self.0)
        } else if self.0 < 60 * 1000 {
            write!(f, "{} second(s)", self.0 / 1000)
        } else if self.0 < 60 * 60 * 1000 {
            write!(f, "{} minute(s)", self.0 / 1000 / 60)
        } else {
            write!(f, "{} hour(s)", self.0 / 1000 / 60 / 60)
        }
    }
}

impl std::ops::Add<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> LocalDuration {
        LocalDuration(self.0 + other.0)
    }
}

impl std::ops::Mul<u32> for LocalDuration {
    type Output = LocalDuration;

    fn mul(self, other: u32) -> LocalDuration {
        LocalDuration(self.0 * other as u128)
    }
}
