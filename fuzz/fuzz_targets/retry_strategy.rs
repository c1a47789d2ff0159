#![no_main]

use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use orchestrator_retry::{RetryConfig, RetryStrategyType};

fuzz_target!(|data: (u32, u8, u64, u64, u8)| {
    let (attempt, strategy_type, base_ms, cap_ms, jitter_byte) = data;

    let attempt = attempt % 100 + 1; // 1-100
    let strategy = match strategy_type % 4 {
        0 => RetryStrategyType::Immediate,
        1 => RetryStrategyType::Exponential,
        2 => RetryStrategyType::Linear,
        _ => RetryStrategyType::Constant,
    };
    let backoff_base = Duration::from_millis(base_ms % 10000 + 1); // 1-10000ms
    let backoff_cap = Duration::from_millis(cap_ms % 300000 + 100).max(backoff_base); // >= base
    let jitter_fraction = (jitter_byte as f64) / 255.0; // 0.0-1.0

    let config = RetryConfig {
        max_attempts: 100,
        strategy,
        backoff_base,
        backoff_cap,
        jitter_fraction,
        retry_ambiguous: true,
    };
    assert!(config.validate().is_ok());

    let delay = config.delay_for_attempt(attempt);

    // Jitter is added on top of the capped delay, so the bound scales with
    // `jitter_fraction` rather than stopping exactly at `backoff_cap`.
    let bound = backoff_cap.mul_f64(1.0 + jitter_fraction);
    assert!(delay <= bound);

    if strategy == RetryStrategyType::Immediate {
        assert_eq!(delay, Duration::ZERO);
    }

    if strategy == RetryStrategyType::Constant && jitter_fraction == 0.0 {
        assert_eq!(delay, backoff_base.min(backoff_cap));
    }
});