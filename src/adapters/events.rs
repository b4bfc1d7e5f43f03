use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;

use crate::domain::sample::GpsFix;

const CONSUMER_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Emitted once per trip, after its first successful finalization commits.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedTripEvent {
    pub trip_id: String,
    pub first_gps_fix: Option<GpsFix>,
    pub started_at: String,
}

#[derive(Debug, Error)]
pub enum EventSinkError {
    #[error("event consumer disconnected")]
    Disconnected,
}

pub trait TripEventSink: Send + Sync + 'static {
    fn publish(&self, event: FinalizedTripEvent) -> Result<(), EventSinkError>;
}

/// Hands events to a consumer thread so publishing never waits on enrichment.
#[derive(Debug, Clone)]
pub struct ChannelTripEventSink {
    sender: Sender<FinalizedTripEvent>,
}

impl ChannelTripEventSink {
    pub fn new() -> (Self, Receiver<FinalizedTripEvent>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl TripEventSink for ChannelTripEventSink {
    fn publish(&self, event: FinalizedTripEvent) -> Result<(), EventSinkError> {
        self.sender
            .send(event)
            .map_err(|_| EventSinkError::Disconnected)
    }
}

/// Drops events after logging them. Used where no enrichment consumer runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardingTripEventSink;

impl TripEventSink for DiscardingTripEventSink {
    fn publish(&self, event: FinalizedTripEvent) -> Result<(), EventSinkError> {
        tracing::debug!(trip_id = %event.trip_id, "finalized trip event discarded");
        Ok(())
    }
}

pub fn start_event_consumer<H>(
    receiver: Receiver<FinalizedTripEvent>,
    mut handler: H,
    stop_flag: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    H: FnMut(FinalizedTripEvent) + Send + 'static,
{
    std::thread::spawn(move || {
        while !stop_flag.load(Ordering::Relaxed) {
            match receiver.recv_timeout(CONSUMER_POLL_INTERVAL) {
                Ok(event) => handler(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    })
}
