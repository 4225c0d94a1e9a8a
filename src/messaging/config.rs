use std::time::Duration;
use anyhow::bail;

#[derive(Debug, Clone)]
pub struct SendQueueConfig {
    /// Initial outbound bandwidth cap in kbit/s, 0 meaning 'no cap'. This can be changed at
    ///  runtime via [SendQueue::set_max_bandwidth](crate::messaging::send_queue::SendQueue::set_max_bandwidth).
    pub max_bandwidth_kbits: u32,

    /// interval at which the drain task evicts stale bookkeeping (see the TTLs below) and
    ///  expired send listeners
    pub sweep_interval: Duration,

    /// Outstanding requests are registered for response correlation when they are sent, and
    ///  they are normally removed when the response arrives or the waiting caller gives up. If
    ///  neither happens (e.g. the waiting future was dropped), this is when they are evicted.
    pub request_ttl: Duration,

    /// Batches stay registered for response attribution until the application removes them.
    ///  Batches that were never removed are evicted after this time.
    pub batch_ttl: Duration,
}

impl Default for SendQueueConfig {
    fn default() -> Self {
        SendQueueConfig::new()
    }
}

impl SendQueueConfig {
    pub fn new() -> SendQueueConfig {
        SendQueueConfig {
            max_bandwidth_kbits: 0,
            sweep_interval: Duration::from_secs(10),
            request_ttl: Duration::from_secs(10 * 60),
            batch_ttl: Duration::from_secs(30 * 60),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must be positive");
        }
        if self.request_ttl.is_zero() {
            bail!("request TTL must be positive");
        }
        if self.batch_ttl.is_zero() {
            bail!("batch TTL must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SendQueueConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_bandwidth_kbits, 0);
    }

    #[rstest]
    #[case::sweep_interval(|c: &mut SendQueueConfig| c.sweep_interval = Duration::ZERO)]
    #[case::request_ttl(|c: &mut SendQueueConfig| c.request_ttl = Duration::ZERO)]
    #[case::batch_ttl(|c: &mut SendQueueConfig| c.batch_ttl = Duration::ZERO)]
    fn test_validate_rejects_zero_durations(#[case] mangle: fn(&mut SendQueueConfig)) {
        let mut config = SendQueueConfig::new();
        mangle(&mut config);
        assert!(config.validate().is_err());
    }
}
