use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{sync::mpsc, time::Instant};
use types::{
    CURSOR_EXPIRED_CODE, ErrorKind, GatewayConfig, SUBSCRIBER_LAGGED_CODE, StreamEvent,
    StreamPayload,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastSettings {
    /// Events kept per run for replay.
    pub ring_capacity: usize,
    /// Events a subscriber may fall behind before it is dropped.
    pub subscriber_capacity: usize,
    /// How long a finished run's log is kept for late resumes.
    pub finished_run_retention: Duration,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for BroadcastSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            ring_capacity: config.event_buffer_capacity.max(1),
            subscriber_capacity: config.subscriber_queue_capacity.max(1),
            finished_run_retention: Duration::from_secs(config.finished_run_retention_secs),
        }
    }
}

struct Subscriber {
    sender: mpsc::Sender<StreamEvent>,
    lagged: Arc<AtomicBool>,
}

struct RunLog {
    run_id: String,
    events: VecDeque<StreamEvent>,
    next_cursor: u64,
    terminal: bool,
    finished_at: Option<Instant>,
    subscribers: Vec<Subscriber>,
}

impl RunLog {
    fn new(run_id: String, capacity: usize) -> Self {
        Self {
            run_id,
            events: VecDeque::with_capacity(capacity),
            next_cursor: 1,
            terminal: false,
            finished_at: None,
            subscribers: Vec::new(),
        }
    }

    fn oldest_cursor(&self) -> u64 {
        self.events
            .front()
            .map_or(self.next_cursor, |event| event.cursor)
    }
}

/// Per-session fan-out of run events with a bounded replay ring.
///
/// Every run restarts cursors at 1. Subscribers never apply backpressure to
/// the producer: one that falls `subscriber_capacity` events behind is cut
/// off and ends with a `subscriber_lagged` error.
pub struct StreamBroadcaster {
    settings: BroadcastSettings,
    sessions: DashMap<String, Arc<Mutex<RunLog>>>,
}

impl StreamBroadcaster {
    pub fn new(settings: BroadcastSettings) -> Self {
        Self {
            settings,
            sessions: DashMap::new(),
        }
    }

    pub fn settings(&self) -> BroadcastSettings {
        self.settings
    }

    /// Starts a fresh event log for `session_id`, discarding the previous
    /// run's replay buffer.
    pub fn begin_run(&self, session_id: &str, run_id: &str) {
        let log = RunLog::new(run_id.to_owned(), self.settings.ring_capacity);
        if let Some(previous) = self
            .sessions
            .insert(session_id.to_owned(), Arc::new(Mutex::new(log)))
        {
            let previous = previous.lock().unwrap_or_else(PoisonError::into_inner);
            if !previous.terminal {
                tracing::warn!(
                    session_id,
                    previous_run_id = %previous.run_id,
                    "replacing an event log that never reached a terminal event"
                );
            }
        }
    }

    /// Stamps `payload` with the next cursor and delivers it. Returns the
    /// cursor, or `None` when the session has no log or its run already
    /// ended.
    pub fn publish(&self, session_id: &str, payload: StreamPayload) -> Option<u64> {
        let log = self.log(session_id)?;
        let mut log = log.lock().unwrap_or_else(PoisonError::into_inner);
        if log.terminal {
            tracing::debug!(
                session_id,
                event_type = payload.event_type(),
                "dropping event published after the terminal event"
            );
            return None;
        }

        let cursor = log.next_cursor;
        log.next_cursor += 1;
        let terminal = payload.is_terminal();
        let event = StreamEvent {
            cursor,
            run_id: log.run_id.clone(),
            payload,
        };

        if log.events.len() >= self.settings.ring_capacity {
            log.events.pop_front();
        }
        log.events.push_back(event.clone());

        log.subscribers.retain(|subscriber| {
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(session_id, cursor, "dropping lagging stream subscriber");
                    subscriber.lagged.store(true, Ordering::SeqCst);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        if terminal {
            log.terminal = true;
            log.finished_at = Some(Instant::now());
            log.subscribers.clear();
        }
        Some(cursor)
    }

    /// Subscribes to the current run of `session_id`, replaying buffered
    /// events after `since_cursor` (or from the start of the buffer).
    ///
    /// Returns `None` when the session never had a run.
    pub fn subscribe(&self, session_id: &str, since_cursor: Option<u64>) -> Option<Subscription> {
        let log = self.log(session_id)?;
        let mut log = log.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(since) = since_cursor
            && since.saturating_add(1) < log.oldest_cursor()
        {
            let payload = StreamPayload::Error {
                code: CURSOR_EXPIRED_CODE.to_owned(),
                kind: ErrorKind::NotFound,
                message: format!(
                    "cursor {since} is older than the replay buffer (oldest {})",
                    log.oldest_cursor()
                ),
                retryable: false,
            };
            return Some(Subscription::closed(VecDeque::from([StreamEvent {
                cursor: since,
                run_id: log.run_id.clone(),
                payload,
            }])));
        }

        let since = since_cursor.unwrap_or(0);
        let replay = log
            .events
            .iter()
            .filter(|event| event.cursor > since)
            .cloned()
            .collect::<VecDeque<_>>();
        if log.terminal {
            return Some(Subscription::closed(replay));
        }

        let (sender, receiver) = mpsc::channel(self.settings.subscriber_capacity);
        let lagged = Arc::new(AtomicBool::new(false));
        log.subscribers.push(Subscriber {
            sender,
            lagged: lagged.clone(),
        });
        Some(Subscription {
            replay,
            receiver: Some(receiver),
            lagged,
            run_id: log.run_id.clone(),
            last_cursor: since,
            finished: false,
        })
    }

    /// Cursor of the newest event of the session's current run.
    pub fn last_cursor(&self, session_id: &str) -> Option<u64> {
        let log = self.log(session_id)?;
        let log = log.lock().unwrap_or_else(PoisonError::into_inner);
        log.next_cursor.checked_sub(1).filter(|cursor| *cursor > 0)
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.log(session_id).map_or(0, |log| {
            log.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .subscribers
                .len()
        })
    }

    /// Subscribers of the session's current run whose client is still
    /// attached.
    pub fn live_subscriber_count(&self, session_id: &str) -> usize {
        self.log(session_id).map_or(0, |log| {
            log.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .subscribers
                .iter()
                .filter(|subscriber| !subscriber.sender.is_closed())
                .count()
        })
    }

    /// Drops the logs of runs that ended longer than the retention ago.
    /// Returns how many were removed.
    pub fn purge_finished(&self) -> usize {
        let now = Instant::now();
        let retention = self.settings.finished_run_retention;
        let mut purged = 0;
        self.sessions.retain(|_, log| {
            let log = log.lock().unwrap_or_else(PoisonError::into_inner);
            let expired = log
                .finished_at
                .is_some_and(|finished_at| now.duration_since(finished_at) >= retention);
            purged += usize::from(expired);
            !expired
        });
        purged
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn log(&self, session_id: &str) -> Option<Arc<Mutex<RunLog>>> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }
}

/// Ordered view of one run's events for a single client.
pub struct Subscription {
    replay: VecDeque<StreamEvent>,
    receiver: Option<mpsc::Receiver<StreamEvent>>,
    lagged: Arc<AtomicBool>,
    run_id: String,
    last_cursor: u64,
    finished: bool,
}

impl Subscription {
    fn closed(replay: VecDeque<StreamEvent>) -> Self {
        let run_id = replay
            .front()
            .map(|event| event.run_id.clone())
            .unwrap_or_default();
        Self {
            replay,
            receiver: None,
            lagged: Arc::new(AtomicBool::new(false)),
            run_id,
            last_cursor: 0,
            finished: false,
        }
    }

    /// Next event, or `None` once the run's terminal event has been
    /// returned or the subscriber was cut off.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = match self.replay.pop_front() {
            Some(event) => Some(event),
            None => match self.receiver.as_mut() {
                Some(receiver) => receiver.recv().await,
                None => None,
            },
        };
        match event {
            Some(event) => {
                self.last_cursor = event.cursor;
                if event.payload.is_terminal() {
                    self.finished = true;
                }
                Some(event)
            }
            None => {
                self.finished = true;
                self.lagged.load(Ordering::SeqCst).then(|| StreamEvent {
                    cursor: self.last_cursor,
                    run_id: self.run_id.clone(),
                    payload: StreamPayload::Error {
                        code: SUBSCRIBER_LAGGED_CODE.to_owned(),
                        kind: ErrorKind::Internal,
                        message: format!(
                            "subscriber fell behind; resume from cursor {}",
                            self.last_cursor
                        ),
                        retryable: true,
                    },
                })
            }
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}
