//! Event Bus - 이벤트 브로드캐스트 시스템
//!
//! 모든 스트림이 하나의 broadcast 채널을 공유하고, 수신 측에서 스트림 이름으로 거릅니다.
//! 히스토리는 스트림별로 따로 보관하므로 시끄러운 스트림이 다른 세션의 replay를 밀어내지 않습니다.

use super::types::{EventCategory, LabEvent, ServerEvent};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::{trace, warn};

// ============================================================================
// EventFilter
// ============================================================================

/// 이벤트 필터
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub categories: Option<Vec<EventCategory>>,

    /// 스트림 이름 (정확히 일치)
    pub streams: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_categories(mut self, categories: Vec<EventCategory>) -> Self {
        self.categories = Some(categories);
        self
    }

    pub fn with_streams(mut self, streams: Vec<String>) -> Self {
        self.streams = Some(streams);
        self
    }

    pub fn matches(&self, event: &LabEvent) -> bool {
        if let Some(ref cats) = self.categories {
            if !cats.contains(&event.category) {
                return false;
            }
        }
        if let Some(ref streams) = self.streams {
            if !streams.iter().any(|s| s == &event.stream) {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// 이벤트 버스 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBusConfig {
    /// 브로드캐스트 채널 용량
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// 스트림당 이벤트 히스토리 보관 개수
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// 디버그 모드 (모든 이벤트 로깅)
    #[serde(default)]
    pub debug_mode: bool,
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_history_size() -> usize {
    200
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            history_size: default_history_size(),
            debug_mode: false,
        }
    }
}

/// 이벤트 버스
///
/// ```ignore
/// let bus = EventBus::new();
/// let mut rx = bus.stream(&streams::terminal("abc"));
/// bus.emit(streams::terminal("abc"), ServerEvent::output("hi")).await;
/// let event = rx.recv().await;
/// ```
pub struct EventBus {
    config: EventBusConfig,

    sender: broadcast::Sender<LabEvent>,

    /// stream -> (publish sequence, event), oldest first
    history: RwLock<HashMap<String, VecDeque<(u64, LabEvent)>>>,

    event_count: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));

        Self {
            config,
            sender,
            history: RwLock::new(HashMap::new()),
            event_count: AtomicU64::new(0),
        }
    }

    /// Wrap `payload` for `stream` and publish it
    pub async fn emit(&self, stream: impl Into<String>, payload: ServerEvent) {
        self.publish(LabEvent::new(stream, payload)).await;
    }

    /// 이벤트 발행
    pub async fn publish(&self, event: LabEvent) {
        let event_count = self.event_count.fetch_add(1, Ordering::SeqCst);

        if self.config.debug_mode {
            trace!(
                event_id = %event.id,
                stream = %event.stream,
                category = event.category.as_str(),
                "Publishing event #{}", event_count + 1
            );
        }

        {
            let mut history = self.history.write().await;
            let ring = history.entry(event.stream.clone()).or_default();
            ring.push_back((event_count, event.clone()));
            while ring.len() > self.config.history_size {
                ring.pop_front();
            }
        }

        // no receivers is fine
        let _ = self.sender.send(event);
    }

    /// Receiver that only yields events of `stream`
    pub fn stream(&self, stream: &str) -> StreamReceiver {
        StreamReceiver {
            streams: vec![stream.to_string()],
            inner: self.sender.subscribe(),
        }
    }

    /// Receiver over several streams at once
    pub fn streams(&self, streams: Vec<String>) -> StreamReceiver {
        StreamReceiver {
            streams,
            inner: self.sender.subscribe(),
        }
    }

    /// Retained output of `stream`, oldest first (used to repaint a resumed terminal)
    pub async fn replay(&self, stream: &str) -> Vec<LabEvent> {
        let filter = EventFilter::new()
            .with_streams(vec![stream.to_string()])
            .with_categories(vec![EventCategory::Output]);
        self.search_history(&filter).await
    }

    /// 필터로 히스토리 검색 (발행순)
    pub async fn search_history(&self, filter: &EventFilter) -> Vec<LabEvent> {
        let history = self.history.read().await;
        let rings: Vec<&VecDeque<(u64, LabEvent)>> = match filter.streams {
            Some(ref streams) => streams.iter().filter_map(|s| history.get(s)).collect(),
            None => history.values().collect(),
        };

        let mut found: Vec<&(u64, LabEvent)> = rings
            .into_iter()
            .flatten()
            .filter(|(_, e)| filter.matches(e))
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, e)| e.clone()).collect()
    }

    /// Drop the retained history of `stream`
    pub async fn forget(&self, stream: &str) {
        self.history.write().await.remove(stream);
    }

    /// 총 발행된 이벤트 수
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// StreamReceiver
// ============================================================================

/// Filtered view over the bus
pub struct StreamReceiver {
    streams: Vec<String>,
    inner: broadcast::Receiver<LabEvent>,
}

impl StreamReceiver {
    /// Next event on one of the watched streams; `None` once the bus is gone.
    /// Lagged events are skipped with a warning.
    pub async fn recv(&mut self) -> Option<LabEvent> {
        loop {
            match self.inner.recv().await {
                Ok(event) if self.streams.iter().any(|s| s == &event.stream) => {
                    return Some(event)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, streams = ?self.streams, "Event receiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Watch one more stream (e.g. after a session id becomes known)
    pub fn add_stream(&mut self, stream: impl Into<String>) {
        let stream = stream.into();
        if !self.streams.contains(&stream) {
            self.streams.push(stream);
        }
    }

    pub fn remove_stream(&mut self, stream: &str) {
        self.streams.retain(|s| s != stream);
    }
}

// ============================================================================
// 테스트
// ============================================================================
