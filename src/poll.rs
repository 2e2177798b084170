use std::future::Future;

use crate::errors::{Error, Result};
use tokio::time::{sleep, Duration, Instant};

/// Default delay between two polls.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);

/// Default number of polls before giving up (~10 minutes with the default interval).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 40;

/// Fixed-interval, bounded polling configuration.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Config {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl Config {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

/// Calls "check" until it returns a value, an error, or the attempts run out.
/// "check" returns "Ok(None)" to keep polling.
/// The first poll runs with no wait.
pub async fn until<T, F, Fut>(desc: &str, cfg: &Config, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    log::info!(
        "polling '{}' with interval {:?} and max attempts {}",
        desc,
        cfg.interval,
        cfg.max_attempts
    );

    let start = Instant::now();
    let mut cnt: u32 = 0;
    while cnt < cfg.max_attempts {
        if cnt > 0 {
            sleep(cfg.interval).await;
        }
        cnt += 1;

        if let Some(v) = check().await? {
            log::info!(
                "poll '{}' done (attempt {}, elapsed {:?})",
                desc,
                cnt,
                start.elapsed()
            );
            return Ok(v);
        }
        log::info!(
            "poll '{}' not ready (attempt {}/{}, elapsed {:?})",
            desc,
            cnt,
            cfg.max_attempts,
            start.elapsed()
        );
    }

    Err(Error::Other {
        message: format!(
            "failed to poll '{}' in time ({} attempts)",
            desc, cfg.max_attempts
        ),
        retryable: true,
    })
}

/// RUST_LOG=debug cargo test --package ec2-swap --lib -- poll::test_until --exact --show-output
#[test]
fn test_until() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let cfg = Config::new(Duration::from_millis(1), 5);

    let mut calls = 0;
    let ret = ab!(until("ready on third", &cfg, || {
        calls += 1;
        let n = calls;
        async move {
            if n == 3 {
                Ok(Some(n))
            } else {
                Ok(None)
            }
        }
    }));
    assert_eq!(ret.unwrap(), 3);
    assert_eq!(calls, 3);

    let mut calls = 0;
    let ret: Result<()> = ab!(until("never ready", &cfg, || {
        calls += 1;
        async { Ok(None) }
    }));
    let e = ret.unwrap_err();
    assert!(e.retryable());
    assert!(e.message().contains("never ready"));
    assert_eq!(calls, 5);

    let mut calls = 0;
    let ret: Result<()> = ab!(until("terminal", &cfg, || {
        calls += 1;
        async {
            Err(Error::Other {
                message: String::from("image failed"),
                retryable: false,
            })
        }
    }));
    let e = ret.unwrap_err();
    assert!(!e.retryable());
    assert_eq!(calls, 1);
}

#[test]
fn test_default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.interval, Duration::from_secs(15));
    assert_eq!(cfg.max_attempts, 40);
}
