//! RTP transceivers, senders and receivers
//!
//! A transceiver owns exactly one sender and one receiver. Each of the three
//! can be handed out under its own handle; they all keep the owning peer
//! connection's engine object alive so stats can still be collected after the
//! peer connection handle is released.

use std::fmt;
use std::sync::Arc;

use crate::config::{MediaType, TransceiverDirection};
use crate::engine::{
    NativePeerConnection, NativeRtpReceiver, NativeRtpSender, NativeRtpTransceiver, StatsSelector,
};
use crate::error::RtcError;
use crate::stats::{self, StatsReport};

pub struct RtpSender {
    native: Arc<dyn NativeRtpSender>,
    peer: Arc<dyn NativePeerConnection>,
}

impl RtpSender {
    pub(crate) fn new(native: Arc<dyn NativeRtpSender>, peer: Arc<dyn NativePeerConnection>) -> Self {
        Self { native, peer }
    }

    pub fn id(&self) -> String {
        self.native.id()
    }

    pub fn media_type(&self) -> MediaType {
        self.native.media_type()
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.native.stream_ids()
    }

    /// Outbound RTP stats for this sender. `on_delivered` fires exactly once.
    pub fn get_stats<C, F>(self: &Arc<Self>, context: C, on_delivered: F)
    where
        C: Send + 'static,
        F: FnOnce(C, StatsReport) + Send + 'static,
    {
        let selector = StatsSelector::Sender(self.id());
        stats::collect(&self.peer, selector, Arc::clone(self), context, on_delivered);
    }
}

impl fmt::Debug for RtpSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpSender")
            .field("id", &self.native.id())
            .field("media_type", &self.native.media_type())
            .finish()
    }
}

pub struct RtpReceiver {
    native: Arc<dyn NativeRtpReceiver>,
    peer: Arc<dyn NativePeerConnection>,
}

impl RtpReceiver {
    pub(crate) fn new(
        native: Arc<dyn NativeRtpReceiver>,
        peer: Arc<dyn NativePeerConnection>,
    ) -> Self {
        Self { native, peer }
    }

    pub fn id(&self) -> String {
        self.native.id()
    }

    pub fn media_type(&self) -> MediaType {
        self.native.media_type()
    }

    /// Inbound RTP stats for this receiver. `on_delivered` fires exactly once.
    pub fn get_stats<C, F>(self: &Arc<Self>, context: C, on_delivered: F)
    where
        C: Send + 'static,
        F: FnOnce(C, StatsReport) + Send + 'static,
    {
        let selector = StatsSelector::Receiver(self.id());
        stats::collect(&self.peer, selector, Arc::clone(self), context, on_delivered);
    }
}

impl fmt::Debug for RtpReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpReceiver")
            .field("id", &self.native.id())
            .field("media_type", &self.native.media_type())
            .finish()
    }
}

pub struct RtpTransceiver {
    native: Arc<dyn NativeRtpTransceiver>,
    sender: Arc<RtpSender>,
    receiver: Arc<RtpReceiver>,
}

impl RtpTransceiver {
    pub(crate) fn new(
        native: Arc<dyn NativeRtpTransceiver>,
        peer: Arc<dyn NativePeerConnection>,
    ) -> Arc<Self> {
        let sender = Arc::new(RtpSender::new(native.sender(), Arc::clone(&peer)));
        let receiver = Arc::new(RtpReceiver::new(native.receiver(), peer));
        Arc::new(Self {
            native,
            sender,
            receiver,
        })
    }

    /// `None` until the transceiver has been negotiated
    pub fn mid(&self) -> Option<String> {
        self.native.mid()
    }

    pub fn media_type(&self) -> MediaType {
        self.native.media_type()
    }

    pub fn direction(&self) -> TransceiverDirection {
        self.native.direction()
    }

    pub fn sender(&self) -> Arc<RtpSender> {
        Arc::clone(&self.sender)
    }

    pub fn receiver(&self) -> Arc<RtpReceiver> {
        Arc::clone(&self.receiver)
    }

    pub fn stop(&self) -> Result<(), RtcError> {
        self.native.stop()
    }
}

impl fmt::Debug for RtpTransceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpTransceiver")
            .field("mid", &self.native.mid())
            .field("media_type", &self.native.media_type())
            .field("direction", &self.native.direction())
            .finish()
    }
}
