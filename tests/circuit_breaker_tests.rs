//! Breaker behavior across the boundaries the unit tests cannot cover:
//! separate breaker instances sharing persisted state, the way short-lived
//! invocations hand the circuit to each other.

use baton::{CircuitBreaker, CircuitState, ContextStore};
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("tracker unreachable")]
struct TrackerDown;

async fn fail_once(breaker: &CircuitBreaker, key: &str) {
    let _ = breaker
        .call(key, || async { Err::<(), _>(TrackerDown) })
        .await;
}

#[tokio::test]
async fn circuit_opened_in_one_invocation_blocks_the_next() {
    let dir = TempDir::new().unwrap();
    let store = ContextStore::new(dir.path());

    // First invocation: three consecutive failures open the circuit.
    let first = CircuitBreaker::new(3, Duration::from_secs(300));
    for _ in 0..3 {
        fail_once(&first, "persona/validator").await;
    }
    assert_eq!(first.state("persona/validator"), CircuitState::Open);
    first.persist(&store, "breakers.json").unwrap();

    // Second invocation starts from the persisted snapshot and refuses the
    // call without ever reaching the collaborator.
    let second =
        CircuitBreaker::load(3, Duration::from_secs(300), &store, "breakers.json").unwrap();
    let mut reached = false;
    let result = second
        .call("persona/validator", || {
            reached = true;
            async { Ok::<_, TrackerDown>(()) }
        })
        .await;
    assert!(result.is_err());
    assert!(!reached);
}

#[tokio::test]
async fn persisted_cooldown_elapses_in_wall_time() {
    let dir = TempDir::new().unwrap();
    let store = ContextStore::new(dir.path());

    let first = CircuitBreaker::new(2, Duration::from_millis(30));
    for _ in 0..2 {
        fail_once(&first, "git-remote").await;
    }
    first.persist(&store, "breakers.json").unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;

    // opened_at is a wall-clock timestamp, so a later invocation sees the
    // cooldown as elapsed and admits the probe.
    let second =
        CircuitBreaker::load(2, Duration::from_millis(30), &store, "breakers.json").unwrap();
    let result = second
        .call("git-remote", || async { Ok::<_, TrackerDown>("back up") })
        .await;
    assert_eq!(result.unwrap(), "back up");
    assert_eq!(second.state("git-remote"), CircuitState::Closed);
}

#[tokio::test]
async fn successful_keys_do_not_leak_into_failing_ones() {
    let breaker = CircuitBreaker::new(2, Duration::from_secs(300));

    for _ in 0..2 {
        fail_once(&breaker, "tracker").await;
    }
    for _ in 0..5 {
        let ok = breaker
            .call("git-remote", || async { Ok::<_, TrackerDown>(()) })
            .await;
        assert!(ok.is_ok());
    }

    assert_eq!(breaker.state("tracker"), CircuitState::Open);
    assert_eq!(breaker.state("git-remote"), CircuitState::Closed);
    assert_eq!(breaker.failure_count("git-remote"), 0);
}
