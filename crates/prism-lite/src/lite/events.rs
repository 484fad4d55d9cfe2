//! Typed publish/subscribe used for forward lifecycle notifications.

use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    fmt,
    net::{IpAddr, SocketAddr},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::SystemTime,
};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::lite::registry::ActiveForward;

type Handler = Arc<dyn Fn(&mut dyn Any) + Send + Sync>;

/// Hook run with the event after every subscriber has seen it.
pub type AfterHook<E> = Box<dyn FnOnce(&E) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    priority: i32,
    handler: Handler,
}

#[derive(Default)]
pub struct EventManager {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<TypeId, Vec<Subscription>>>,
}

impl fmt::Debug for EventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types = self
            .subscribers
            .read()
            .map(|s| s.len())
            .unwrap_or_default();
        f.debug_struct("EventManager")
            .field("event_types", &types)
            .finish()
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of type `E`. Lower priorities run first; equal
    /// priorities run in registration order.
    pub fn subscribe<E, F>(&self, priority: i32, handler: F) -> SubscriptionId
    where
        E: Any,
        F: Fn(&mut E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(move |event: &mut dyn Any| {
            if let Some(event) = event.downcast_mut::<E>() {
                handler(event);
            }
        });

        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let list = subs.entry(TypeId::of::<E>()).or_default();
        let at = list.partition_point(|s| s.priority <= priority);
        list.insert(
            at,
            Subscription {
                id,
                priority,
                handler,
            },
        );
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let mut found = false;
        subs.retain(|_, list| {
            let before = list.len();
            list.retain(|s| s.id != id);
            found |= list.len() != before;
            !list.is_empty()
        });
        found
    }

    pub fn has_subscriber<E: Any>(&self) -> bool {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .is_some_and(|l| !l.is_empty())
    }

    fn handlers<E: Any>(&self) -> Vec<Handler> {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .map(|l| l.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default()
    }

    /// Runs every subscriber of `E` on the calling thread. A panicking subscriber is logged
    /// and skipped.
    pub fn fire<E: Any>(&self, event: &mut E) {
        let handlers = self.handlers::<E>();
        let event: &mut dyn Any = event;
        for handler in handlers {
            let res = catch_unwind(AssertUnwindSafe(|| handler(&mut *event)));
            if let Err(panic) = res {
                tracing::error!(
                    event = type_name::<E>(),
                    panic = %panic_message(panic.as_ref()),
                    "events: subscriber panicked"
                );
            }
        }
    }

    /// Fires `event` on the blocking pool, then runs `after` with the (possibly mutated)
    /// event. The handle resolves to the event once everything has run.
    pub fn fire_parallel<E>(self: &Arc<Self>, mut event: E, after: Vec<AfterHook<E>>) -> JoinHandle<E>
    where
        E: Any + Send,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            this.fire(&mut event);
            for hook in after {
                let res = catch_unwind(AssertUnwindSafe(|| hook(&event)));
                if let Err(panic) = res {
                    tracing::error!(
                        event = type_name::<E>(),
                        panic = %panic_message(panic.as_ref()),
                        "events: after hook panicked"
                    );
                }
            }
            event
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardEndReason {
    ClientClosed,
    BackendClosed,
    BackendConnectFailed,
    Timeout,
    Shutdown,
    Error,
}

impl ForwardEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardEndReason::ClientClosed => "client_closed",
            ForwardEndReason::BackendClosed => "backend_closed",
            ForwardEndReason::BackendConnectFailed => "backend_connect_failed",
            ForwardEndReason::Timeout => "timeout",
            ForwardEndReason::Shutdown => "shutdown",
            ForwardEndReason::Error => "error",
        }
    }
}

impl fmt::Display for ForwardEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardStartedEvent {
    pub connection_id: String,
    pub client_ip: Option<IpAddr>,
    pub client_addr: SocketAddr,
    pub backend_addr: SocketAddr,
    pub host: String,
    pub route_id: String,
    pub started_at: SystemTime,
}

impl From<&ActiveForward> for ForwardStartedEvent {
    fn from(f: &ActiveForward) -> Self {
        Self {
            connection_id: f.connection_id.clone(),
            client_ip: f.client_ip,
            client_addr: f.client_addr,
            backend_addr: f.backend_addr,
            host: f.host.clone(),
            route_id: f.route_id.clone(),
            started_at: f.started_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardEndedEvent {
    pub connection_id: String,
    pub client_ip: Option<IpAddr>,
    pub client_addr: SocketAddr,
    /// `None` when no backend could be dialed.
    pub backend_addr: Option<SocketAddr>,
    pub host: String,
    pub route_id: String,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
    pub reason: ForwardEndReason,
}

impl ForwardEndedEvent {
    pub fn from_forward(f: &ActiveForward, ended_at: SystemTime, reason: ForwardEndReason) -> Self {
        Self {
            connection_id: f.connection_id.clone(),
            client_ip: f.client_ip,
            client_addr: f.client_addr,
            backend_addr: Some(f.backend_addr),
            host: f.host.clone(),
            route_id: f.route_id.clone(),
            started_at: f.started_at,
            ended_at,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    struct Ping {
        trail: Vec<&'static str>,
    }

    #[derive(Debug)]
    struct Other;

    fn push(tag: &'static str) -> impl Fn(&mut Ping) + Send + Sync + 'static {
        move |e: &mut Ping| e.trail.push(tag)
    }

    #[test]
    fn priority_then_registration_order() {
        let em = EventManager::new();
        em.subscribe(10, push("late"));
        em.subscribe(0, push("a"));
        em.subscribe(-5, push("first"));
        em.subscribe(0, push("b"));

        let mut e = Ping::default();
        em.fire(&mut e);
        assert_eq!(e.trail, vec!["first", "a", "b", "late"]);
    }

    #[test]
    fn panicking_subscriber_does_not_stop_others() {
        let em = EventManager::new();
        em.subscribe(0, push("before"));
        em.subscribe(1, |_: &mut Ping| panic!("boom"));
        em.subscribe(2, push("after"));

        let mut e = Ping::default();
        em.fire(&mut e);
        assert_eq!(e.trail, vec!["before", "after"]);
    }

    #[test]
    fn subscribers_are_per_type() {
        let em = EventManager::new();
        assert!(!em.has_subscriber::<Ping>());
        let id = em.subscribe(0, push("x"));
        assert!(em.has_subscriber::<Ping>());
        assert!(!em.has_subscriber::<Other>());

        let mut other = Other;
        em.fire(&mut other);

        assert!(em.unsubscribe(id));
        assert!(!em.unsubscribe(id));
        assert!(!em.has_subscriber::<Ping>());
    }

    #[test]
    fn subscriber_may_subscribe_during_fire() {
        let em = Arc::new(EventManager::new());
        let inner = em.clone();
        em.subscribe(0, move |e: &mut Ping| {
            e.trail.push("outer");
            inner.subscribe(1, push("added"));
        });

        let mut e = Ping::default();
        em.fire(&mut e);
        assert_eq!(e.trail, vec!["outer"]);
    }

    #[tokio::test]
    async fn fire_parallel_runs_after_hooks_with_mutated_event() {
        let em = Arc::new(EventManager::new());
        em.subscribe(0, push("sub"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s1 = seen.clone();
        let s2 = seen.clone();
        let hooks: Vec<AfterHook<Ping>> = vec![
            Box::new(move |e: &Ping| s1.lock().expect("lock").push(e.trail.len())),
            Box::new(|_: &Ping| panic!("hook boom")),
            Box::new(move |e: &Ping| s2.lock().expect("lock").push(e.trail.len() * 10)),
        ];

        let e = em
            .fire_parallel(Ping::default(), hooks)
            .await
            .expect("join");
        assert_eq!(e.trail, vec!["sub"]);
        assert_eq!(*seen.lock().expect("lock"), vec![1, 10]);
    }

    #[test]
    fn end_reason_names() {
        assert_eq!(ForwardEndReason::BackendConnectFailed.to_string(), "backend_connect_failed");
        assert_eq!(
            serde_json::to_string(&ForwardEndReason::ClientClosed).expect("json"),
            "\"client_closed\""
        );
    }
}
