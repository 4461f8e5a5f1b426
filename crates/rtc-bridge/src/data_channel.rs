//! Data channel bridge
//!
//! Wraps an engine data channel with an [`ObserverSlot`] so that foreign
//! observers can be swapped or removed while the network thread is
//! delivering messages. Backpressure is advisory: callers watch
//! [`DataChannel::buffered_amount`] (or `on_buffered_amount_change`) and
//! throttle themselves.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::completion::{Completion, CompletionResult};
use crate::engine::{DataChannelSink, NativeDataChannel};
use crate::error::{RtcError, RtcErrorDetail, RtcErrorKind};
use crate::observer::ObserverSlot;

/// Data channel lifecycle. Observed only; the bridge never sets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for DataChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataChannelState::Connecting => "connecting",
            DataChannelState::Open => "open",
            DataChannelState::Closing => "closing",
            DataChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Borrowed message payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBuffer<'a> {
    pub data: &'a [u8],
    pub binary: bool,
}

impl<'a> DataBuffer<'a> {
    pub fn binary(data: &'a [u8]) -> Self {
        Self { data, binary: true }
    }

    pub fn text(text: &'a str) -> Self {
        Self {
            data: text.as_bytes(),
            binary: false,
        }
    }

    /// Payload as text, for non-binary messages
    pub fn as_text(&self) -> Option<&'a str> {
        if self.binary {
            None
        } else {
            std::str::from_utf8(self.data).ok()
        }
    }
}

/// Data channel notifications. Invoked on the network thread.
pub trait DataChannelObserver: Send + Sync {
    fn on_state_change(&self, state: DataChannelState);

    fn on_message(&self, buffer: DataBuffer<'_>);

    fn on_buffered_amount_change(&self, _buffered_amount: u64) {}
}

type ObserverSlotRef = ObserverSlot<dyn DataChannelObserver>;

/// Engine-facing sink forwarding into the observer slot
struct SlotSink {
    slot: Weak<ObserverSlotRef>,
}

impl DataChannelSink for SlotSink {
    fn on_state_change(&self, state: DataChannelState) {
        if let Some(slot) = self.slot.upgrade() {
            slot.deliver(|observer| observer.on_state_change(state));
        }
    }

    fn on_message(&self, buffer: DataBuffer<'_>) {
        if let Some(slot) = self.slot.upgrade() {
            slot.deliver(|observer| observer.on_message(buffer));
        }
    }

    fn on_buffered_amount_change(&self, buffered_amount: u64) {
        if let Some(slot) = self.slot.upgrade() {
            slot.deliver(|observer| observer.on_buffered_amount_change(buffered_amount));
        }
    }
}

pub struct DataChannel {
    native: Arc<dyn NativeDataChannel>,
    observer: Arc<ObserverSlotRef>,
    sink: Arc<dyn DataChannelSink>,
    /// Whether `sink` is currently registered with the engine
    sink_installed: Mutex<bool>,
    max_message_size: usize,
}

impl DataChannel {
    pub(crate) fn new(native: Arc<dyn NativeDataChannel>, max_message_size: usize) -> Arc<Self> {
        let observer: Arc<ObserverSlotRef> = Arc::new(ObserverSlot::new("data_channel"));
        let sink: Arc<dyn DataChannelSink> = Arc::new(SlotSink {
            slot: Arc::downgrade(&observer),
        });
        debug!(label = %native.label(), id = ?native.id(), "data channel bridged");
        Arc::new(Self {
            native,
            observer,
            sink,
            sink_installed: Mutex::new(false),
            max_message_size,
        })
    }

    /// Install `observer`, replacing any previous one. The previous observer
    /// receives nothing once this returns.
    pub fn register_observer(&self, observer: Arc<dyn DataChannelObserver>) {
        let replaced = self.observer.register(observer);
        let mut installed = self.sink_installed.lock();
        if !*installed && self.observer.is_registered() {
            self.native.register_observer(Arc::clone(&self.sink));
            *installed = true;
        }
        trace!(label = %self.native.label(), replaced, "data channel observer registered");
    }

    /// Remove the observer. Blocks until an in-flight callback on another
    /// thread has returned; no callback is delivered afterwards.
    pub fn unregister_observer(&self) {
        let previous = self.observer.unregister();
        {
            let mut installed = self.sink_installed.lock();
            if *installed && !self.observer.is_registered() {
                self.native.unregister_observer();
                *installed = false;
            }
        }
        if previous.is_some() {
            trace!(label = %self.native.label(), "data channel observer unregistered");
        }
        drop(previous);
    }

    pub fn has_observer(&self) -> bool {
        self.observer.is_registered()
    }

    /// Queue `data` for delivery. `on_complete` fires exactly once, when the
    /// engine accepts or rejects the payload.
    pub fn send_async(&self, data: &[u8], binary: bool, on_complete: Completion<()>) {
        if let Err(err) = self.check_payload(data, binary) {
            on_complete.fail(err);
            return;
        }
        self.native.send(DataBuffer { data, binary }, on_complete);
    }

    /// `send_async` for Rust callers
    pub async fn send(&self, data: &[u8], binary: bool) -> CompletionResult<()> {
        let (completion, rx) = Completion::channel("data_channel_send");
        self.send_async(data, binary, completion);
        rx.await
            .unwrap_or_else(|_| Err(RtcError::internal("send completion lost")))
    }

    pub async fn send_text(&self, text: &str) -> CompletionResult<()> {
        self.send(text.as_bytes(), false).await
    }

    fn check_payload(&self, data: &[u8], binary: bool) -> Result<(), RtcError> {
        if data.len() > self.max_message_size {
            return Err(RtcError::new(
                RtcErrorKind::InvalidRange,
                format!(
                    "message of {} bytes exceeds the {} byte limit",
                    data.len(),
                    self.max_message_size
                ),
            )
            .with_detail(RtcErrorDetail::DataChannelFailure));
        }
        if !binary {
            if let Err(err) = std::str::from_utf8(data) {
                return Err(RtcError::invalid_parameter(format!(
                    "text message is not valid UTF-8: {err}"
                )));
            }
        }
        Ok(())
    }

    /// Start closing; state moves to `closed` asynchronously
    pub fn close(&self) {
        self.native.close();
    }

    pub fn state(&self) -> DataChannelState {
        self.native.state()
    }

    pub fn buffered_amount(&self) -> u64 {
        self.native.buffered_amount()
    }

    pub fn label(&self) -> String {
        self.native.label()
    }

    pub fn id(&self) -> Option<u16> {
        self.native.id()
    }

    pub fn protocol(&self) -> String {
        self.native.protocol()
    }

    pub fn negotiated(&self) -> bool {
        self.native.negotiated()
    }

    pub fn ordered(&self) -> bool {
        self.native.ordered()
    }

    pub fn max_retransmits(&self) -> Option<u16> {
        self.native.max_retransmits()
    }

    pub fn max_retransmit_time(&self) -> Option<u16> {
        self.native.max_retransmit_time()
    }
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        self.unregister_observer();
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.native.label())
            .field("id", &self.native.id())
            .field("state", &self.native.state())
            .finish()
    }
}
