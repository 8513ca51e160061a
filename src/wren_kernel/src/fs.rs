//! The fd readiness layer
//!
//! A file descriptor, from the core's viewpoint, is a lock semaphore, two
//! readiness bits and an embedded [`Condition`]. Concrete devices populate
//! the read/write callbacks; blocking I/O is the composition of the fd lock
//! and a criteria-matched wait on the condition. The condition's lock
//! callbacks *are* the fd lock, so a parked reader does not hold the
//! descriptor against producers and writers.
use core::fmt;

use crate::{
    error::{FsError, ObtainSemaphoreError, ResultCode, SuspendConditionError},
    klock::{self, CpuLockCell, CpuLockTokenRef},
    semaphore::Semaphore,
    task,
    utils::Init,
    wait::{self, CondLockHooks, Condition, Resume, ResumeParam, Suspend, SuspendParam},
    KernelTraits, Port, Tick, MAX_WAIT,
};

bitflags::bitflags! {
    /// Per-fd flags word.
    pub struct FsFlags: u32 {
        /// Blocking semantics requested: a read/write with the relevant
        /// readiness bit clear parks the caller instead of failing.
        const BLOCK = 1 << 0;
        const DATA_AVAILABLE = 1 << 1;
        const SPACE_AVAILABLE = 1 << 2;
    }
}

impl Init for FsFlags {
    const INIT: Self = Self::empty();
}

/// Readiness-criteria bit: the waiter wants `DATA_AVAILABLE`.
pub const FS_BLOCK_READ: u32 = 1 << 0;
/// Readiness-criteria bit: the waiter wants `SPACE_AVAILABLE`.
pub const FS_BLOCK_WRITE: u32 = 1 << 1;

/// Device read callback. Called with the fd lock held and the CPU Lock
/// inactive; returns the number of bytes produced.
pub type FsReadFn<Traits> = fn(&'static FsNode<Traits>, &mut [u8]) -> usize;
/// Device write callback, symmetric to [`FsReadFn`].
pub type FsWriteFn<Traits> = fn(&'static FsNode<Traits>, &[u8]) -> usize;

/// A file descriptor node. Caller-provided; attach with [`Self::register`].
pub struct FsNode<Traits: Port> {
    flags: CpuLockCell<Traits, FsFlags>,
    lock: Semaphore<Traits>,
    condition: Condition<Traits>,
    read_fn: CpuLockCell<Traits, Option<FsReadFn<Traits>>>,
    write_fn: CpuLockCell<Traits, Option<FsWriteFn<Traits>>>,
    /// Device-private word.
    data: CpuLockCell<Traits, usize>,
}

impl<Traits: Port> Init for FsNode<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        flags: Init::INIT,
        lock: Init::INIT,
        condition: Init::INIT,
        read_fn: Init::INIT,
        write_fn: Init::INIT,
        data: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for FsNode<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsNode")
            .field("self", &(self as *const _))
            .field("flags", &self.flags.debug_fmt_with(|x, f| x.bits().fmt(f)))
            .finish()
    }
}

/// Recover the node a condition belongs to.
///
/// Safety: `data` is only ever set by `register` to the address of a
/// `'static` node.
fn node_from_data<Traits: Port>(data: usize) -> &'static FsNode<Traits> {
    unsafe { &*(data as *const FsNode<Traits>) }
}

/// Suspend unless the readiness bit named by the waiter's criteria is
/// already set.
fn fs_do_suspend<Traits: KernelTraits>(
    token: CpuLockTokenRef<'_, Traits>,
    data: usize,
    param: &SuspendParam,
) -> bool {
    let node = node_from_data::<Traits>(data);
    let flags = node.flags.get(&*token);
    match *param {
        SuspendParam::Criteria(criteria) => {
            if criteria & FS_BLOCK_READ != 0 && flags.contains(FsFlags::DATA_AVAILABLE) {
                return false;
            }
            if criteria & FS_BLOCK_WRITE != 0 && flags.contains(FsFlags::SPACE_AVAILABLE) {
                return false;
            }
            true
        }
        SuspendParam::None => true,
    }
}

/// Wake waiters whose criteria overlap the producer's.
fn fs_do_resume(param: &mut ResumeParam, suspend: &SuspendParam) -> bool {
    match (*param, *suspend) {
        (ResumeParam::Criteria(want), SuspendParam::Criteria(have)) => want & have != 0,
        _ => true,
    }
}

/// Condition lock hook: the fd lock.
fn fs_condition_lock<Traits: KernelTraits>(data: usize) {
    let node = node_from_data::<Traits>(data);
    // A deleted node resumes its waiters with `FS_NODE_DELETED`; the lock
    // failure itself is surfaced on the I/O path
    let _ = node.lock.obtain(MAX_WAIT);
}

/// Condition unlock hook: the fd lock.
fn fs_condition_unlock<Traits: KernelTraits>(data: usize) {
    let node = node_from_data::<Traits>(data);
    node.lock.release();
}

impl<Traits: KernelTraits> FsNode<Traits> {
    /// Attach the node: create its lock, wire the condition to the
    /// readiness predicate, and record the device callbacks.
    pub fn register(
        &'static self,
        flags: FsFlags,
        read_fn: Option<FsReadFn<Traits>>,
        write_fn: Option<FsWriteFn<Traits>>,
        data: usize,
    ) {
        self.lock.create(1);

        let mut lock = klock::lock_cpu::<Traits>().expect("fs register with CPU Lock active");
        self.flags.replace(&mut *lock, flags);
        self.read_fn.replace(&mut *lock, read_fn);
        self.write_fn.replace(&mut *lock, write_fn);
        self.data.replace(&mut *lock, data);
        self.condition.init_locked(
            lock.borrow_mut(),
            self as *const Self as usize,
            Some(fs_do_suspend::<Traits>),
        );
        self.condition.set_lock_hooks_locked(
            lock.borrow_mut(),
            CondLockHooks {
                lock: fs_condition_lock::<Traits>,
                unlock: fs_condition_unlock::<Traits>,
                data: self as *const Self as usize,
            },
        );
    }

    /// Obtain the fd lock, waiting up to `timeout` ticks.
    pub fn get_lock(&'static self, timeout: Tick) -> Result<(), ObtainSemaphoreError> {
        self.lock.obtain(timeout)
    }

    pub fn release_lock(&'static self) {
        self.lock.release();
    }

    /// The current flags word.
    pub fn flags(&self) -> FsFlags {
        let lock = klock::lock_cpu::<Traits>().expect("fs flags with CPU Lock active");
        self.flags.get(&*lock)
    }

    /// The device-private word registered with the node.
    pub fn device_data(&self) -> usize {
        let lock = klock::lock_cpu::<Traits>().expect("fs device_data with CPU Lock active");
        self.data.get(&*lock)
    }

    fn set_flag_and_resume(&'static self, flag: FsFlags, criteria: u32) {
        let mut lock = klock::lock_cpu::<Traits>().expect("fs producer with CPU Lock active");
        let flags = self.flags.get(&*lock);
        self.flags.replace(&mut *lock, flags | flag);
        let mut resume = Resume {
            status: ResultCode::TASK_RESUME,
            do_resume: Some(fs_do_resume),
            param: ResumeParam::Criteria(criteria),
        };
        wait::resume_condition_locked(lock.borrow_mut(), &self.condition, &mut resume);
        task::unlock_cpu_and_check_preemption::<Traits>(lock);
    }

    fn clear_flag(&self, flag: FsFlags) {
        let mut lock = klock::lock_cpu::<Traits>().expect("fs producer with CPU Lock active");
        let flags = self.flags.get(&*lock);
        self.flags.replace(&mut *lock, flags & !flag);
    }

    /// Producer notification: the device has data to read. ISR-safe.
    pub fn data_available(&'static self) {
        self.set_flag_and_resume(FsFlags::DATA_AVAILABLE, FS_BLOCK_READ);
    }

    /// Producer notification: the pending data has been drained.
    pub fn data_flushed(&self) {
        self.clear_flag(FsFlags::DATA_AVAILABLE);
    }

    /// Producer notification: the device can accept writes. ISR-safe.
    pub fn space_available(&'static self) {
        self.set_flag_and_resume(FsFlags::SPACE_AVAILABLE, FS_BLOCK_WRITE);
    }

    /// Producer notification: the write window has been used up.
    pub fn space_consumed(&self) {
        self.clear_flag(FsFlags::SPACE_AVAILABLE);
    }

    /// Resume waiters whose criteria overlap `criteria` (all waiters when
    /// `None`) with the given status. With `FS_NODE_DELETED`, this is the
    /// deterministic-teardown path for higher layers.
    pub fn handle_criteria(&'static self, criteria: Option<u32>, status: ResultCode) {
        let mut lock =
            klock::lock_cpu::<Traits>().expect("fs handle_criteria with CPU Lock active");
        let mut resume = match criteria {
            Some(mask) => Resume {
                status,
                do_resume: Some(fs_do_resume),
                param: ResumeParam::Criteria(mask),
            },
            None => Resume {
                status,
                do_resume: None,
                param: ResumeParam::None,
            },
        };
        wait::resume_condition_locked(lock.borrow_mut(), &self.condition, &mut resume);
        task::unlock_cpu_and_check_preemption::<Traits>(lock);
    }

    /// Tear the node down: resume every readiness waiter with
    /// `FS_NODE_DELETED`, then destroy the fd lock (which resumes lock
    /// waiters the same way).
    pub fn destroy(&'static self) {
        self.handle_criteria(None, ResultCode::FS_NODE_DELETED);
        self.lock.destroy();

        let mut lock = klock::lock_cpu::<Traits>().expect("fs destroy with CPU Lock active");
        self.flags.replace(&mut *lock, FsFlags::empty());
        self.read_fn.replace(&mut *lock, None);
        self.write_fn.replace(&mut *lock, None);
        self.data.replace(&mut *lock, 0);
        self.condition.init_locked(lock.borrow_mut(), 0, None);
    }

    /// Read from the device. Blocks until `DATA_AVAILABLE` if the node has
    /// `BLOCK` set; fails with `WouldBlock` otherwise.
    pub fn read(&'static self, buffer: &mut [u8]) -> Result<usize, FsError> {
        self.get_lock(MAX_WAIT)?;
        let result = self.read_with_lock_held(buffer);
        // A deleted node must not be touched again; its lock is gone too
        if !matches!(result, Err(FsError::NodeDeleted)) {
            self.release_lock();
        }
        result
    }

    fn read_with_lock_held(&'static self, buffer: &mut [u8]) -> Result<usize, FsError> {
        loop {
            let (flags, read_fn) = {
                let lock = klock::lock_cpu::<Traits>()?;
                (self.flags.get(&*lock), self.read_fn.get(&*lock))
            };

            if flags.contains(FsFlags::DATA_AVAILABLE) {
                let Some(read_fn) = read_fn else { return Ok(0) };
                return Ok(read_fn(self, buffer));
            }
            if !flags.contains(FsFlags::BLOCK) {
                return Err(FsError::WouldBlock);
            }

            self.await_readiness(FS_BLOCK_READ)?;
        }
    }

    /// Write to the device, symmetric to [`Self::read`] on
    /// `SPACE_AVAILABLE`.
    pub fn write(&'static self, buffer: &[u8]) -> Result<usize, FsError> {
        self.get_lock(MAX_WAIT)?;
        let result = self.write_with_lock_held(buffer);
        // A deleted node must not be touched again; its lock is gone too
        if !matches!(result, Err(FsError::NodeDeleted)) {
            self.release_lock();
        }
        result
    }

    fn write_with_lock_held(&'static self, buffer: &[u8]) -> Result<usize, FsError> {
        loop {
            let (flags, write_fn) = {
                let lock = klock::lock_cpu::<Traits>()?;
                (self.flags.get(&*lock), self.write_fn.get(&*lock))
            };

            if flags.contains(FsFlags::SPACE_AVAILABLE) {
                let Some(write_fn) = write_fn else { return Ok(0) };
                return Ok(write_fn(self, buffer));
            }
            if !flags.contains(FsFlags::BLOCK) {
                return Err(FsError::WouldBlock);
            }

            self.await_readiness(FS_BLOCK_WRITE)?;
        }
    }

    /// Park on the readiness condition. The caller holds the fd lock; it is
    /// released for the duration of the park through the condition's lock
    /// hooks and re-obtained before this returns.
    fn await_readiness(&'static self, criteria: u32) -> Result<(), FsError> {
        let suspends = [Suspend::new(SuspendParam::Criteria(criteria))];
        let conditions = [&self.condition];
        match wait::suspend_condition(&conditions, &suspends, true) {
            Ok(_) => Ok(()),
            Err(SuspendConditionError::Aborted(code)) if code == ResultCode::FS_NODE_DELETED => {
                Err(FsError::NodeDeleted)
            }
            Err(SuspendConditionError::Aborted(code)) => Err(FsError::Status(code)),
            Err(SuspendConditionError::Timeout) => Err(FsError::Timeout),
            Err(SuspendConditionError::BadContext) => Err(FsError::BadContext),
        }
    }
}
