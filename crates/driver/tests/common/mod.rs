//! Shared test plumbing: a mock USB backend that records submitted
//! transfers and replays programmed inbound frames, plus a capturing
//! tracing layer so tests can assert on the log sink.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once, OnceLock};
use std::time::{Duration, Instant};

use openhand_driver::transport::{
    BulkUsb, CompletionSink, OutCompletion, OutTransfer, TransferStatus, TransmitOwner, UsbError,
};
use tracing::Level;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};

// ── Mock transport ──────────────────────────────────────────────────────

enum MockEvent {
    Out {
        data: Vec<u8>,
        owner: TransmitOwner,
        submitted_len: usize,
    },
    In {
        data: Vec<u8>,
    },
}

#[derive(Default)]
struct MockState {
    submitted: Vec<Vec<u8>>,
    pending: VecDeque<MockEvent>,
    woken: bool,
}

/// A `BulkUsb` that completes every OUT transfer immediately and lets
/// the test inject IN frames.
pub struct MockUsb {
    state: Mutex<MockState>,
    changed: Condvar,
    receive_pool: AtomicUsize,
}

impl Default for MockUsb {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            changed: Condvar::new(),
            receive_pool: AtomicUsize::new(0),
        }
    }
}

impl MockUsb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a device-to-host frame for the event pump.
    pub fn push_in_frame(&self, data: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.pending.push_back(MockEvent::In { data });
        self.changed.notify_all();
    }

    /// Number of transfers submitted so far.
    pub fn submission_count(&self) -> usize {
        self.state.lock().unwrap().submitted.len()
    }

    /// Size of the receive pool the handler requested.
    pub fn receive_pool_size(&self) -> usize {
        self.receive_pool.load(Ordering::Relaxed)
    }

    /// Block until at least `count` transfers were submitted; returns
    /// them all.
    ///
    /// # Panics
    ///
    /// Panics when `timeout` elapses first.
    pub fn wait_for_submissions(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if state.submitted.len() >= count {
                return state.submitted.clone();
            }
            let now = Instant::now();
            assert!(
                now < deadline,
                "timed out waiting for {count} submissions (got {})",
                state.submitted.len()
            );
            let (next, _) = self.changed.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }

    /// Block until a transfer at index `>= start` satisfies `predicate`;
    /// returns `(index, frame)`.
    ///
    /// # Panics
    ///
    /// Panics when `timeout` elapses first.
    pub fn wait_for_frame(
        &self,
        start: usize,
        timeout: Duration,
        predicate: impl Fn(&[u8]) -> bool,
    ) -> (usize, Vec<u8>) {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some((index, frame)) = state
                .submitted
                .iter()
                .enumerate()
                .skip(start)
                .find(|(_, frame)| predicate(frame))
            {
                return (index, frame.clone());
            }
            let now = Instant::now();
            assert!(now < deadline, "timed out waiting for a matching frame");
            let (next, _) = self.changed.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }
}

impl BulkUsb for MockUsb {
    fn submit_out(&self, transfer: OutTransfer) -> Result<(), UsbError> {
        let OutTransfer { data, owner } = transfer;
        let mut state = self.state.lock().unwrap();
        state.submitted.push(data.clone());
        let submitted_len = data.len();
        state.pending.push_back(MockEvent::Out {
            data,
            owner,
            submitted_len,
        });
        self.changed.notify_all();
        Ok(())
    }

    fn start_receive_pool(&self, count: usize, _len: usize) -> Result<(), UsbError> {
        self.receive_pool.store(count, Ordering::Relaxed);
        Ok(())
    }

    fn handle_events(
        &self,
        budget: Duration,
        sink: &mut dyn CompletionSink,
    ) -> Result<(), UsbError> {
        let mut state = self.state.lock().unwrap();
        if state.pending.is_empty() && !state.woken {
            let (next, _) = self.changed.wait_timeout(state, budget).unwrap();
            state = next;
        }
        state.woken = false;
        let events: Vec<_> = state.pending.drain(..).collect();
        drop(state);

        for event in events {
            match event {
                MockEvent::Out {
                    mut data,
                    owner,
                    submitted_len,
                } => {
                    data.clear();
                    sink.out_completed(OutCompletion {
                        data,
                        owner,
                        status: TransferStatus::Completed,
                        submitted_len,
                        actual_len: submitted_len,
                    });
                }
                MockEvent::In { data } => {
                    sink.in_completed(&data, TransferStatus::Completed);
                }
            }
        }
        Ok(())
    }

    fn wake(&self) {
        let mut state = self.state.lock().unwrap();
        state.woken = true;
        self.changed.notify_all();
    }
}

/// Wrap an SDO payload in a device response frame (header + padding).
pub fn sdo_response_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x55, 0xAA, 0xA0, 0x00, 0x00, 0x00, 0x21, 0x00];
    frame.extend_from_slice(payload);
    while frame.len() % 16 != 0 {
        frame.push(0);
    }
    frame
}

// ── Log capture ─────────────────────────────────────────────────────────

/// One captured log event.
pub type LogEvent = (Level, String);

struct CaptureLayer {
    events: Arc<Mutex<Vec<LogEvent>>>,
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for CaptureLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.events
            .lock()
            .unwrap()
            .push((*event.metadata().level(), visitor.message));
    }
}

/// Install the process-wide capturing subscriber (once) and return the
/// shared event store.
pub fn captured_logs() -> Arc<Mutex<Vec<LogEvent>>> {
    static INIT: Once = Once::new();
    static EVENTS: OnceLock<Arc<Mutex<Vec<LogEvent>>>> = OnceLock::new();

    INIT.call_once(|| {
        let events = Arc::new(Mutex::new(Vec::new()));
        let _ = EVENTS.set(Arc::clone(&events));
        let subscriber = tracing_subscriber::registry().with(CaptureLayer { events });
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
    Arc::clone(EVENTS.get().expect("capture store initialized"))
}
