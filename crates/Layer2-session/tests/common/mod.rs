//! 통합 테스트 공용 헬퍼 - HostEngine 위에 LabEngine 구성

#![allow(dead_code)]

use labterm_foundation::{EngineConfig, LabEvent, ServerEvent, StreamReceiver};
use labterm_session::{HostEngine, LabEngine};
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn engine_with(config: EngineConfig) -> (LabEngine, Arc<HostEngine>) {
    let host = Arc::new(HostEngine::new());
    let engine = LabEngine::with_engine(config, host.clone()).expect("engine");
    (engine, host)
}

pub fn engine() -> (LabEngine, Arc<HostEngine>) {
    let mut config = EngineConfig::default();
    config.executor.retry.initial_delay_ms = 10;
    config.executor.retry.max_delay_ms = 50;
    engine_with(config)
}

/// Receive until `pred` matches; panics after [`WAIT`]
pub async fn next_matching<F>(rx: &mut StreamReceiver, mut pred: F) -> LabEvent
where
    F: FnMut(&ServerEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event.payload) => return event,
                Some(_) => continue,
                None => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn wait_for_status(rx: &mut StreamReceiver, wanted: &str) -> LabEvent {
    next_matching(rx, |e| matches!(e, ServerEvent::Status { state, .. } if state == wanted)).await
}

/// Collect terminal output until it contains `needle`
pub async fn wait_for_output(rx: &mut StreamReceiver, needle: &str) -> String {
    let mut seen = String::new();
    tokio::time::timeout(WAIT, async {
        while !seen.contains(needle) {
            match rx.recv().await {
                Some(LabEvent { payload: ServerEvent::Output { output }, .. }) => seen.push_str(&output),
                Some(_) => {}
                None => panic!("event bus closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {:?} in output: {:?}", needle, seen));
    seen
}

/// Poll `check` every 20ms until it holds
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never held");
}
