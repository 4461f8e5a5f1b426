//! Handle registry
//!
//! Maps opaque, caller-visible [`Handle`]s to shared references of native
//! objects. The registry owns one `Arc` per handle and nothing more: the
//! engine may hold further references, and an object outlives its handle
//! whenever someone else still needs it.
//!
//! Handle values are allocated from a monotonic counter and are never reused
//! for the lifetime of the process, so a stale handle can only ever resolve to
//! [`Error::InvalidHandle`].

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use crate::data_channel::DataChannel;
use crate::error::{Error, Result, RtcError};
use crate::jsep::{IceCandidate, SessionDescription};
use crate::peer_connection::PeerConnection;
use crate::rtp::{RtpReceiver, RtpSender, RtpTransceiver};

/// Opaque identifier for a bridged object. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(NonZeroU64);

impl Handle {
    /// Rebuild a handle from its raw value; `0` is the null handle
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Handle)
    }

    pub fn as_raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of object a handle refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    PeerConnection,
    DataChannel,
    RtpTransceiver,
    RtpSender,
    RtpReceiver,
    SessionDescription,
    IceCandidate,
    Error,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::PeerConnection => "peer connection",
            ObjectKind::DataChannel => "data channel",
            ObjectKind::RtpTransceiver => "rtp transceiver",
            ObjectKind::RtpSender => "rtp sender",
            ObjectKind::RtpReceiver => "rtp receiver",
            ObjectKind::SessionDescription => "session description",
            ObjectKind::IceCandidate => "ice candidate",
            ObjectKind::Error => "error",
        };
        f.write_str(name)
    }
}

/// A registry entry: one shared reference to a bridged object
#[derive(Clone)]
pub enum BridgeObject {
    PeerConnection(Arc<PeerConnection>),
    DataChannel(Arc<DataChannel>),
    RtpTransceiver(Arc<RtpTransceiver>),
    RtpSender(Arc<RtpSender>),
    RtpReceiver(Arc<RtpReceiver>),
    SessionDescription(Arc<SessionDescription>),
    IceCandidate(Arc<IceCandidate>),
    Error(Arc<RtcError>),
}

impl BridgeObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            BridgeObject::PeerConnection(_) => ObjectKind::PeerConnection,
            BridgeObject::DataChannel(_) => ObjectKind::DataChannel,
            BridgeObject::RtpTransceiver(_) => ObjectKind::RtpTransceiver,
            BridgeObject::RtpSender(_) => ObjectKind::RtpSender,
            BridgeObject::RtpReceiver(_) => ObjectKind::RtpReceiver,
            BridgeObject::SessionDescription(_) => ObjectKind::SessionDescription,
            BridgeObject::IceCandidate(_) => ObjectKind::IceCandidate,
            BridgeObject::Error(_) => ObjectKind::Error,
        }
    }
}

impl fmt::Debug for BridgeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BridgeObject").field(&self.kind()).finish()
    }
}

/// Types that can be stored behind a handle
pub trait Bridged: Send + Sync + Sized + 'static {
    const KIND: ObjectKind;

    fn into_object(this: Arc<Self>) -> BridgeObject;

    fn from_object(object: &BridgeObject) -> Option<Arc<Self>>;
}

macro_rules! impl_bridged {
    ($ty:ty, $variant:ident) => {
        impl Bridged for $ty {
            const KIND: ObjectKind = ObjectKind::$variant;

            fn into_object(this: Arc<Self>) -> BridgeObject {
                BridgeObject::$variant(this)
            }

            fn from_object(object: &BridgeObject) -> Option<Arc<Self>> {
                match object {
                    BridgeObject::$variant(inner) => Some(Arc::clone(inner)),
                    _ => None,
                }
            }
        }
    };
}

impl_bridged!(PeerConnection, PeerConnection);
impl_bridged!(DataChannel, DataChannel);
impl_bridged!(RtpTransceiver, RtpTransceiver);
impl_bridged!(RtpSender, RtpSender);
impl_bridged!(RtpReceiver, RtpReceiver);
impl_bridged!(SessionDescription, SessionDescription);
impl_bridged!(IceCandidate, IceCandidate);
impl_bridged!(RtcError, Error);

/// Concurrent handle table
pub struct HandleRegistry {
    entries: DashMap<u64, BridgeObject>,
    next: AtomicU64,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    /// Register a shared reference and return a fresh handle for it
    pub fn create<T: Bridged>(&self, object: Arc<T>) -> Handle {
        self.insert(T::into_object(object))
    }

    /// Register an already type-erased object
    pub fn insert(&self, object: BridgeObject) -> Handle {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        let Some(id) = NonZeroU64::new(raw).filter(|id| id.get() != u64::MAX) else {
            error!("handle space exhausted");
            std::process::abort();
        };

        trace!(handle = raw, kind = %object.kind(), "handle created");
        self.entries.insert(raw, object);
        Handle(id)
    }

    /// Resolve a handle to a live object of type `T`
    pub fn resolve<T: Bridged>(&self, handle: Handle) -> Result<Arc<T>> {
        let object = self.resolve_object(handle)?;
        T::from_object(&object).ok_or(Error::HandleKindMismatch {
            handle,
            expected: T::KIND,
            actual: object.kind(),
        })
    }

    /// Resolve a handle without constraining its kind
    pub fn resolve_object(&self, handle: Handle) -> Result<BridgeObject> {
        self.entries
            .get(&handle.as_raw())
            .map(|entry| entry.value().clone())
            .ok_or(Error::InvalidHandle(handle))
    }

    pub fn kind_of(&self, handle: Handle) -> Option<ObjectKind> {
        self.entries
            .get(&handle.as_raw())
            .map(|entry| entry.value().kind())
    }

    /// Drop the registry's reference. Unknown handles are ignored.
    ///
    /// Returns whether the handle was live.
    pub fn release(&self, handle: Handle) -> bool {
        // The removed reference is dropped after the shard lock is released,
        // so object teardown never runs under the registry lock.
        let removed = self.entries.remove(&handle.as_raw());
        match removed {
            Some((_, object)) => {
                trace!(handle = handle.as_raw(), kind = %object.kind(), "handle released");
                drop(object);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle.as_raw())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release every handle; returns how many were live
    pub fn clear(&self) -> usize {
        let live: Vec<u64> = self.entries.iter().map(|entry| *entry.key()).collect();
        live.into_iter()
            .filter_map(|raw| self.entries.remove(&raw))
            .count()
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("live", &self.entries.len())
            .field("next", &self.next.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RtcErrorKind;
    use crate::jsep::SdpType;

    fn description() -> Arc<SessionDescription> {
        Arc::new(SessionDescription::parse(SdpType::Offer, "v=0\r\n").unwrap())
    }

    #[test]
    fn test_resolve_until_release() {
        let registry = HandleRegistry::new();
        let desc = description();
        let handle = registry.create(Arc::clone(&desc));

        let resolved: Arc<SessionDescription> = registry.resolve(handle).unwrap();
        assert!(Arc::ptr_eq(&resolved, &desc));

        assert!(registry.release(handle));
        assert!(matches!(
            registry.resolve::<SessionDescription>(handle),
            Err(Error::InvalidHandle(h)) if h == handle
        ));
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = HandleRegistry::new();
        let handle = registry.create(description());
        assert!(registry.release(handle));
        assert!(!registry.release(handle));
        assert!(!registry.release(Handle::from_raw(9_999).unwrap()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_release_drops_only_registry_share() {
        let registry = HandleRegistry::new();
        let desc = description();
        let handle = registry.create(Arc::clone(&desc));
        assert_eq!(Arc::strong_count(&desc), 2);

        registry.release(handle);
        assert_eq!(Arc::strong_count(&desc), 1);
        assert_eq!(desc.sdp(), "v=0\r\n");
    }

    #[test]
    fn test_aliased_handles() {
        let registry = HandleRegistry::new();
        let desc = description();
        let first = registry.create(Arc::clone(&desc));
        let second = registry.create(Arc::clone(&desc));
        assert_ne!(first, second);

        registry.release(first);
        let still: Arc<SessionDescription> = registry.resolve(second).unwrap();
        assert!(Arc::ptr_eq(&still, &desc));
    }

    #[test]
    fn test_kind_mismatch() {
        let registry = HandleRegistry::new();
        let handle = registry.create(Arc::new(RtcError::new(RtcErrorKind::InternalError, "x")));
        assert_eq!(registry.kind_of(handle), Some(ObjectKind::Error));

        let err = registry.resolve::<SessionDescription>(handle).unwrap_err();
        assert!(err.is_invalid_handle());
        assert!(matches!(
            err,
            Error::HandleKindMismatch {
                expected: ObjectKind::SessionDescription,
                actual: ObjectKind::Error,
                ..
            }
        ));
    }

    #[test]
    fn test_handles_are_never_reused() {
        let registry = HandleRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1_000 {
            let handle = registry.create(description());
            assert!(seen.insert(handle));
            registry.release(handle);
        }
    }

    #[test]
    fn test_clear() {
        let registry = HandleRegistry::new();
        for _ in 0..10 {
            registry.create(description());
        }
        assert_eq!(registry.clear(), 10);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_null_handle() {
        assert!(Handle::from_raw(0).is_none());
        assert_eq!(Handle::from_raw(7).unwrap().as_raw(), 7);
    }
}
