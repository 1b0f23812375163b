//! Event Bus - 이벤트 브로드캐스트 시스템
//!
//! 발행은 호출자의 스레드에서 동기적으로 이루어집니다. 리스너 목록은
//! 스냅샷으로 복사한 뒤 락 밖에서 호출되므로, 리스너가 `on_event` 안에서
//! 구독을 해제해도 안전합니다. 비동기 소비자는 `receiver()`로 받습니다.

use super::types::{ConduitEvent, EventCategory};
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// 브로드캐스트 채널 용량
const CHANNEL_CAPACITY: usize = 1024;

/// 기본 히스토리 보관 개수
pub const DEFAULT_HISTORY: usize = 100;

/// 구독 핸들
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// 이벤트 리스너
///
/// `on_event`는 발행자의 호출 스택에서 실행됩니다. 오래 걸리는 작업은
/// 직접 하지 말고 넘겨야 합니다.
pub trait EventListener: Send + Sync {
    fn name(&self) -> &str;

    fn on_event(&self, event: &ConduitEvent);
}

// ============================================================================
// EventFilter
// ============================================================================

/// 리스너 구독과 히스토리 검색에 쓰이는 필터. 비어 있으면 모두 통과.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub categories: Option<Vec<EventCategory>>,

    /// prefix 매칭
    pub event_types: Option<Vec<String>>,

    pub invocation_id: Option<String>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_categories(mut self, categories: Vec<EventCategory>) -> Self {
        self.categories = Some(categories);
        self
    }

    pub fn with_event_types(mut self, types: Vec<String>) -> Self {
        self.event_types = Some(types);
        self
    }

    pub fn with_invocation(mut self, id: impl Into<String>) -> Self {
        self.invocation_id = Some(id.into());
        self
    }

    pub fn matches(&self, event: &ConduitEvent) -> bool {
        let category_ok = self
            .categories
            .as_ref()
            .map_or(true, |cats| cats.contains(&event.category));
        let type_ok = self
            .event_types
            .as_ref()
            .map_or(true, |types| types.iter().any(|t| event.event_type.starts_with(t)));
        let invocation_ok = self
            .invocation_id
            .as_deref()
            .map_or(true, |id| event.invocation_id() == Some(id));

        category_ok && type_ok && invocation_ok
    }
}

// ============================================================================
// EventBus
// ============================================================================

#[derive(Clone)]
struct Subscription {
    listener: Arc<dyn EventListener>,
    filter: EventFilter,
}

/// 동기 이벤트 버스
///
/// ```ignore
/// let bus = Arc::new(EventBus::new());
/// let id = bus.subscribe_filtered(
///     printer,
///     EventFilter::new().with_categories(vec![EventCategory::Progress]),
/// );
/// tracker.create("abc", "status", 3)?;   // printer가 0% 이벤트를 받음
/// bus.unsubscribe(id);
/// ```
pub struct EventBus {
    sender: broadcast::Sender<ConduitEvent>,

    /// 등록 순서대로 호출되도록 BTreeMap 사용
    subscriptions: RwLock<BTreeMap<ListenerId, Subscription>>,
    next_listener: AtomicU64,

    history: RwLock<VecDeque<ConduitEvent>>,
    history_size: usize,
    published: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    /// 최근 `size`개의 이벤트를 보관하는 버스. 0이면 보관하지 않음.
    pub fn with_history(size: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            subscriptions: RwLock::new(BTreeMap::new()),
            next_listener: AtomicU64::new(0),
            history: RwLock::new(VecDeque::with_capacity(size.min(DEFAULT_HISTORY))),
            history_size: size,
            published: AtomicU64::new(0),
        }
    }

    /// 모든 이벤트를 받는 리스너 등록
    pub fn subscribe(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.subscribe_filtered(listener, EventFilter::new())
    }

    /// `filter`를 통과하는 이벤트만 받는 리스너 등록
    pub fn subscribe_filtered(
        &self,
        listener: Arc<dyn EventListener>,
        filter: EventFilter,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        debug!(listener = listener.name(), %id, "Listener subscribed");
        self.subscriptions
            .write()
            .insert(id, Subscription { listener, filter });
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let removed = self.subscriptions.write().remove(&id).is_some();
        if removed {
            debug!(%id, "Listener unsubscribed");
        }
        removed
    }

    /// 히스토리 기록, 브로드캐스트, 리스너 호출 순으로 전달
    pub fn publish(&self, event: ConduitEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(event_type = %event.event_type, invocation = ?event.invocation_id(), "Publish");

        if self.history_size > 0 {
            let mut history = self.history.write();
            if history.len() == self.history_size {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // 수신자가 없을 때의 에러는 무시
        let _ = self.sender.send(event.clone());

        let targets: Vec<Subscription> = self
            .subscriptions
            .read()
            .values()
            .filter(|sub| sub.filter.matches(&event))
            .cloned()
            .collect();
        for sub in targets {
            sub.listener.on_event(&event);
        }
    }

    /// 비동기 소비자용 수신자. 생성 이후의 이벤트만 받음.
    pub fn receiver(&self) -> broadcast::Receiver<ConduitEvent> {
        self.sender.subscribe()
    }

    /// 최근 이벤트, 최신순
    pub fn recent(&self, limit: usize) -> Vec<ConduitEvent> {
        self.history.read().iter().rev().take(limit).cloned().collect()
    }

    /// 히스토리 검색, 발행순
    pub fn search_history(&self, filter: &EventFilter) -> Vec<ConduitEvent> {
        self.history
            .read()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// 지금까지 발행된 이벤트 수 (히스토리 크기와 무관)
    pub fn event_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::types::command;
    use parking_lot::Mutex;

    /// 받은 이벤트 타입을 기록하는 리스너
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().clone()
        }
    }

    impl EventListener for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_event(&self, event: &ConduitEvent) {
            self.seen.lock().push(event.event_type.clone());
        }
    }

    /// 첫 이벤트에서 스스로 구독을 해제
    struct OneShot {
        bus: Arc<EventBus>,
        id: Mutex<Option<ListenerId>>,
        calls: AtomicU64,
    }

    impl EventListener for OneShot {
        fn name(&self) -> &str {
            "one-shot"
        }

        fn on_event(&self, _event: &ConduitEvent) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = self.id.lock().take() {
                self.bus.unsubscribe(id);
            }
        }
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let id = bus.subscribe(recorder.clone());

        bus.publish(command::heartbeat("a", "status", 5000));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(command::heartbeat("a", "status", 6000));

        assert_eq!(recorder.seen(), vec!["heartbeat"]);
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(bus.event_count(), 2);
    }

    #[test]
    fn test_filter_matching() {
        let filter = EventFilter::new()
            .with_categories(vec![EventCategory::Command])
            .with_event_types(vec!["command.".to_string()]);

        assert!(filter.matches(&command::completed("a", "status", true, 1)));
        assert!(!filter.matches(&command::heartbeat("a", "status", 5000)));
        assert!(EventFilter::new().matches(&command::heartbeat("a", "status", 5000)));
    }

    #[test]
    fn test_filtered_subscription_by_invocation() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe_filtered(recorder.clone(), EventFilter::new().with_invocation("a"));

        bus.publish(command::heartbeat("a", "status", 6000));
        bus.publish(command::heartbeat("b", "status", 6000));
        bus.publish(command::cancelled("a", "status", "user", 10));

        assert_eq!(recorder.seen(), vec!["heartbeat", "command.cancelled"]);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let bus = Arc::new(EventBus::new());
        let listener = Arc::new(OneShot {
            bus: bus.clone(),
            id: Mutex::new(None),
            calls: AtomicU64::new(0),
        });
        *listener.id.lock() = Some(bus.subscribe(listener.clone()));

        bus.publish(command::heartbeat("a", "status", 5000));
        bus.publish(command::heartbeat("a", "status", 6000));

        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = EventBus::with_history(3);
        for ms in 0..5u64 {
            bus.publish(command::heartbeat("a", "status", ms));
        }

        let recent = bus.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].data["runningTime"], 4);
        assert_eq!(recent[2].data["runningTime"], 2);
        assert_eq!(bus.event_count(), 5);

        let silent = EventBus::with_history(0);
        silent.publish(command::heartbeat("a", "status", 1));
        assert!(silent.recent(1).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_receiver() {
        let bus = EventBus::new();
        let mut rx = bus.receiver();

        bus.publish(command::heartbeat("a", "status", 5001));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.data["runningTime"], 5001);
    }
}
