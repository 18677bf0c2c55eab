//! Background sweep of expired temporary allows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use execguard::config::EngineConfig;
use execguard::engine::run_sweeper;
use execguard::identity::Digest;

use crate::support::{engine_config, engine_with};

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn sweeper_drops_expired_allow_within_one_interval() {
    let (engine, _notices) = engine_with(EngineConfig {
        sweep_interval_secs: 10,
        ..engine_config()
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(run_sweeper(Arc::clone(&engine), shutdown_rx));
    settle().await;

    let past = Utc::now()
        .checked_sub_signed(chrono::Duration::seconds(1))
        .expect("one second ago should be representable");
    engine
        .policy()
        .allow_temporarily_until(Digest::of_bytes(b"stale"), past);
    settle().await;
    assert_eq!(engine.policy().temporary_allow_count(), 1);

    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(engine.policy().temporary_allow_count(), 0);

    shutdown_tx.send(true).expect("sweeper should be listening");
    tokio::time::timeout(Duration::from_secs(1), sweeper)
        .await
        .expect("sweeper should stop on shutdown")
        .expect("sweeper should not panic");
}

#[tokio::test(start_paused = true)]
async fn sweeper_keeps_unexpired_allow() {
    let (engine, _notices) = engine_with(engine_config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(run_sweeper(Arc::clone(&engine), shutdown_rx));

    engine
        .policy()
        .allow_temporarily(Digest::of_bytes(b"fresh"), chrono::Duration::hours(1));
    tokio::time::advance(engine.config().sweep_interval()).await;
    settle().await;
    assert_eq!(engine.policy().temporary_allow_count(), 1);

    drop(shutdown_tx);
    tokio::time::timeout(Duration::from_secs(1), sweeper)
        .await
        .expect("sweeper should stop when the shutdown sender is gone")
        .expect("sweeper should not panic");
}
