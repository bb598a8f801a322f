use std::sync::Arc;
use std::time::Duration;

use ember_memory::config::RateLimitConfig;
use ember_memory::rate_limit::RateLimiter;

#[test]
fn default_window_admits_thirty_then_rejects() {
    let limiter = RateLimiter::from_config(&RateLimitConfig::default());
    for n in 0..30 {
        assert!(limiter.admit("anna"), "request {n} should pass");
    }
    assert!(!limiter.admit("anna"));
    assert_eq!(limiter.remaining("anna"), 0);
}

#[test]
fn expired_window_admits_again() {
    let limiter = RateLimiter::new(2, Duration::from_millis(50));
    assert!(limiter.admit("anna"));
    assert!(limiter.admit("anna"));
    assert!(!limiter.admit("anna"));

    std::thread::sleep(Duration::from_millis(60));
    assert!(limiter.admit("anna"));
    assert!(limiter.admit("anna"));
    assert!(!limiter.admit("anna"));
}

#[test]
fn actors_do_not_share_windows() {
    let limiter = RateLimiter::new(2, Duration::from_secs(60));
    assert!(limiter.admit("anna"));
    assert!(limiter.admit("anna"));
    assert!(!limiter.admit("anna"));

    assert!(limiter.admit("bernd"));
    assert_eq!(limiter.remaining("bernd"), 1);
    assert_eq!(limiter.remaining("anna"), 0);
}

#[test]
fn concurrent_requests_never_exceed_the_ceiling() {
    let limiter = Arc::new(RateLimiter::new(30, Duration::from_secs(60)));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let limiter = limiter.clone();
        handles.push(std::thread::spawn(move || {
            let mut admitted = 0usize;
            for _ in 0..20 {
                if limiter.admit("shared") {
                    admitted += 1;
                }
            }
            admitted
        }));
    }
    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 30);
    assert_eq!(limiter.remaining("shared"), 0);
}
