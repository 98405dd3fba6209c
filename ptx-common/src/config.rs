//! Runtime configuration shared by executor and queue-manager bootstrap code.

use std::time::Duration;

use crate::error::{PtxError, PtxResult};
use crate::ids::PartitionCount;

/// Site configuration consumed by partition executors and the transaction queue manager.
///
/// Loading this from files or flags is the embedding process's job; the core only reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteConfig {
    /// Number of partitions owned by this site.
    pub partition_count: PartitionCount,
    /// Upper bound on how long the run loop blocks waiting for work before servicing maintenance.
    pub work_poll_timeout: Duration,
    /// Minimum wall-clock interval between two engine `tick` calls.
    pub tick_interval: Duration,
    /// Minimum time a lock request waits in the queue before it becomes grantable.
    pub txn_incoming_delay: Duration,
    /// Interval used by the dedicated lock-queue checker thread.
    pub lock_check_interval: Duration,
    /// Number of local transaction states created at startup.
    pub preload_local_txn_states: usize,
    /// Number of remote transaction states created at startup.
    pub preload_remote_txn_states: usize,
    /// Number of dependency records created at startup.
    pub preload_dependency_infos: usize,
    /// Divisor applied to every preload count (large values shrink preloading for tests).
    pub preload_scale_factor: f64,
    /// Threads in each partition's procedure helper pool.
    pub helper_threads: usize,
    /// Run-loop iterations between two error-counter reports.
    pub error_report_polls: u64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            partition_count: PartitionCount::new(4).expect("literal partition count must be non-zero"),
            work_poll_timeout: Duration::from_millis(500),
            tick_interval: Duration::from_secs(1),
            txn_incoming_delay: Duration::from_millis(5),
            lock_check_interval: Duration::from_millis(1),
            preload_local_txn_states: 500,
            preload_remote_txn_states: 500,
            preload_dependency_infos: 10_000,
            preload_scale_factor: 1.0,
            helper_threads: 1,
            error_report_polls: 10_000_000,
        }
    }
}

impl SiteConfig {
    /// Builds a configuration for `partition_count` partitions with every other knob defaulted.
    #[must_use]
    pub fn with_partitions(partition_count: PartitionCount) -> Self {
        Self {
            partition_count,
            ..Self::default()
        }
    }

    /// Checks value ranges that would otherwise stall or spin the run loop.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> PtxResult<()> {
        if self.work_poll_timeout.is_zero() {
            return Err(PtxError::InvalidConfig("work_poll_timeout must be positive"));
        }
        if self.lock_check_interval.is_zero() {
            return Err(PtxError::InvalidConfig("lock_check_interval must be positive"));
        }
        if self.helper_threads == 0 {
            return Err(PtxError::InvalidConfig("helper_threads must be at least 1"));
        }
        if self.error_report_polls == 0 {
            return Err(PtxError::InvalidConfig("error_report_polls must be positive"));
        }
        if !self.preload_scale_factor.is_finite() || self.preload_scale_factor <= 0.0 {
            return Err(PtxError::InvalidConfig(
                "preload_scale_factor must be a positive finite number",
            ));
        }
        Ok(())
    }

    /// Applies `preload_scale_factor` to one preload count.
    #[must_use]
    pub fn scaled_preload(&self, count: usize) -> usize {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let scaled = (count as f64 / self.preload_scale_factor).round() as usize;
        scaled
    }
}

#[cfg(test)]
mod tests {
    use super::SiteConfig;
    use crate::error::PtxError;
    use crate::ids::PartitionCount;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    fn default_config_is_valid() {
        assert_that!(SiteConfig::default().validate().is_ok(), eq(true));
    }

    #[rstest]
    fn zero_poll_timeout_is_rejected() {
        let config = SiteConfig {
            work_poll_timeout: Duration::ZERO,
            ..SiteConfig::default()
        };
        let result = config.validate();
        assert_that!(
            &result,
            eq(&Err(PtxError::InvalidConfig(
                "work_poll_timeout must be positive"
            )))
        );
    }

    #[rstest]
    #[case(0.0)]
    #[case(-2.0)]
    #[case(f64::NAN)]
    fn bad_scale_factor_is_rejected(#[case] factor: f64) {
        let config = SiteConfig {
            preload_scale_factor: factor,
            ..SiteConfig::default()
        };
        assert_that!(config.validate().is_err(), eq(true));
    }

    #[rstest]
    #[case(1.0, 500, 500)]
    #[case(10.0, 500, 50)]
    #[case(1000.0, 500, 1)]
    fn scaled_preload_divides_and_rounds(
        #[case] factor: f64,
        #[case] count: usize,
        #[case] expected: usize,
    ) {
        let config = SiteConfig {
            preload_scale_factor: factor,
            ..SiteConfig::with_partitions(PartitionCount::new(2).expect("literal is valid"))
        };
        assert_that!(config.scaled_preload(count), eq(expected));
    }
}
