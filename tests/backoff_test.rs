use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use taskq_rs::backoff::{BackoffConfig, calculate_backoff, retry_transient};
use taskq_rs::error::Error;

fn fast() -> BackoffConfig {
    BackoffConfig {
        initial_delay: Duration::from_millis(1),
        multiplier: 2.0,
        max_delay: Duration::from_millis(4),
        max_attempts: 4,
    }
}

#[test]
fn backoff_grows_and_caps() {
    let config = BackoffConfig::default();
    assert_eq!(calculate_backoff(&config, 0), Duration::from_millis(100));
    assert_eq!(calculate_backoff(&config, 1), Duration::from_millis(200));
    assert_eq!(calculate_backoff(&config, 3), Duration::from_millis(800));
    assert_eq!(calculate_backoff(&config, 10), Duration::from_secs(5));
    assert_eq!(calculate_backoff(&config, u32::MAX), Duration::from_secs(5));
}

#[tokio::test]
async fn retries_transient_errors_until_success() {
    let calls = AtomicU32::new(0);
    let value = retry_transient(&fast(), "test", || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 2 {
                Err(Error::ChannelUnavailable("down".to_string()))
            } else {
                Ok(n)
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(value, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let calls = AtomicU32::new(0);
    let result: Result<(), Error> = retry_transient(&fast(), "test", || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(Error::BrokerUnavailable("down".to_string())) }
    })
    .await;

    assert!(matches!(result, Err(Error::BrokerUnavailable(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    let calls = AtomicU32::new(0);
    let result: Result<(), Error> = retry_transient(&fast(), "test", || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(Error::NotFound("gone".to_string())) }
    })
    .await;

    assert!(matches!(result, Err(Error::NotFound(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
