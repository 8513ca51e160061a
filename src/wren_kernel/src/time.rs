//! Time conversions, convenience sleeps, and bounded polling.
use crate::{error::PollTimeoutError, KernelCfg, KernelTraits, System, Tick};

/// Convert milliseconds to system ticks, rounding up so a nonzero duration
/// never becomes a zero-tick sleep.
pub fn ms_to_ticks<Traits: KernelCfg>(ms: u32) -> Tick {
    num_integer::div_ceil(ms as u64 * Traits::TICKS_PER_SEC as u64, 1000) as Tick
}

/// Convert microseconds to hardware counter ticks.
pub fn us_to_hw_ticks<Traits: KernelCfg>(us: u32) -> u64 {
    us as u64 * Traits::HW_TICKS_PER_US
}

impl<Traits: KernelTraits> System<Traits> {
    /// Suspend the current task for (at least) the given number of
    /// milliseconds.
    #[cfg(feature = "sleep")]
    pub fn sleep_ms(ms: u32) {
        Self::sleep_ticks(ms_to_ticks::<Traits>(ms));
    }

    /// Busy-wait for the given number of hardware counter ticks. Does not
    /// suspend; used for sub-tick delays inside drivers.
    pub fn sleep_hw_ticks(hw_ticks: u64) {
        let start = Traits::hardware_tick();
        while Traits::hardware_tick().wrapping_sub(start) < hw_ticks {}
    }

    /// Busy-wait until `busy` reports `false`, for at most `timeout_us`
    /// microseconds of hardware time.
    pub fn poll_hw_us(mut busy: impl FnMut() -> bool, timeout_us: u32) -> Result<(), PollTimeoutError> {
        let start = Traits::hardware_tick();
        let budget = us_to_hw_ticks::<Traits>(timeout_us);
        while busy() {
            if Traits::hardware_tick().wrapping_sub(start) > budget {
                return Err(PollTimeoutError::Timeout);
            }
        }
        Ok(())
    }

    /// Like [`Self::poll_hw_us`], but yields the processor between probes.
    pub fn poll_hw_us_yield(
        mut busy: impl FnMut() -> bool,
        timeout_us: u32,
    ) -> Result<(), PollTimeoutError> {
        let start = Traits::hardware_tick();
        let budget = us_to_hw_ticks::<Traits>(timeout_us);
        while busy() {
            if Traits::hardware_tick().wrapping_sub(start) > budget {
                return Err(PollTimeoutError::Timeout);
            }
            Self::task_yield();
        }
        Ok(())
    }

    /// Poll until `busy` reports `false`, for at most `timeout_ms`
    /// milliseconds of system-tick time.
    #[cfg(feature = "sleep")]
    pub fn poll_sw_ms(mut busy: impl FnMut() -> bool, timeout_ms: u32) -> Result<(), PollTimeoutError> {
        let start = Self::current_system_tick();
        let budget = ms_to_ticks::<Traits>(timeout_ms);
        while busy() {
            if Self::current_system_tick().wrapping_sub(start) > budget {
                return Err(PollTimeoutError::Timeout);
            }
        }
        Ok(())
    }

    /// Like [`Self::poll_sw_ms`], but yields the processor between probes.
    #[cfg(feature = "sleep")]
    pub fn poll_sw_ms_yield(
        mut busy: impl FnMut() -> bool,
        timeout_ms: u32,
    ) -> Result<(), PollTimeoutError> {
        let start = Self::current_system_tick();
        let budget = ms_to_ticks::<Traits>(timeout_ms);
        while busy() {
            if Self::current_system_tick().wrapping_sub(start) > budget {
                return Err(PollTimeoutError::Timeout);
            }
            Self::task_yield();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Cfg1k;
    impl KernelCfg for Cfg1k {}

    struct Cfg128;
    impl KernelCfg for Cfg128 {
        const TICKS_PER_SEC: u32 = 128;
        const HW_TICKS_PER_US: u64 = 8;
    }

    #[test]
    fn ms_conversion_rounds_up() {
        assert_eq!(ms_to_ticks::<Cfg1k>(0), 0);
        assert_eq!(ms_to_ticks::<Cfg1k>(1), 1);
        assert_eq!(ms_to_ticks::<Cfg1k>(250), 250);
        // At 128 ticks/s one millisecond is a fraction of a tick, but a
        // nonzero duration must still be at least one tick
        assert_eq!(ms_to_ticks::<Cfg128>(1), 1);
        assert_eq!(ms_to_ticks::<Cfg128>(1000), 128);
        assert_eq!(ms_to_ticks::<Cfg128>(1001), 129);
    }

    #[test]
    fn us_conversion() {
        assert_eq!(us_to_hw_ticks::<Cfg1k>(5), 5);
        assert_eq!(us_to_hw_ticks::<Cfg128>(5), 40);
    }
}
