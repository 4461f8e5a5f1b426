//! Drives the bridge through the C ABI only: handles in, callbacks out

use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use parking_lot::Mutex;
use remotemedia_rtc_bridge::{RtcError, RtcErrorKind};
use remotemedia_rtc_ffi::api::*;
use remotemedia_rtc_ffi::channel::*;
use remotemedia_rtc_ffi::peer::*;
use remotemedia_rtc_ffi::{
    RtcCompletionObserver, RtcCreateSdpObserver, RtcDataChannelObserver, RtcPeerObserver,
};

const WAIT: Duration = Duration::from_secs(5);
const EMPTY_STATS: &str = r#"{"stats":[]}"#;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Sdp(u64),
    Done,
    Failure(String),
    Candidate(u64),
    Channel(u64),
    Message(Vec<u8>, bool),
    Stats(String),
}

/// Foreign-side context handed over as `user_data`
#[derive(Default)]
struct Host {
    events: Mutex<Vec<Event>>,
}

impl Host {
    fn user_data(&self) -> *mut c_void {
        self as *const Host as *mut c_void
    }

    fn push(user_data: *mut c_void, event: Event) {
        let host = unsafe { &*(user_data as *const Host) };
        host.events.lock().push(event);
    }

    /// Remove and return the first event `pick` accepts
    fn take<T>(&self, what: &str, mut pick: impl FnMut(&Event) -> Option<T>) -> anyhow::Result<T> {
        let deadline = Instant::now() + WAIT;
        loop {
            {
                let mut events = self.events.lock();
                if let Some(pos) = events.iter().position(|event| pick(event).is_some()) {
                    let event = events.remove(pos);
                    return pick(&event).context("event vanished");
                }
            }
            if Instant::now() >= deadline {
                bail!("timed out waiting for {what}");
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn sdp(&self) -> anyhow::Result<u64> {
        self.take("description", |event| match event {
            Event::Sdp(handle) => Some(*handle),
            Event::Failure(wire) => panic!("unexpected failure: {wire}"),
            _ => None,
        })
    }

    fn done(&self) -> anyhow::Result<()> {
        self.take("completion", |event| match event {
            Event::Done => Some(()),
            Event::Failure(wire) => panic!("unexpected failure: {wire}"),
            _ => None,
        })
    }

    fn stats(&self) -> anyhow::Result<String> {
        self.take("stats", |event| match event {
            Event::Stats(json) => Some(json.clone()),
            _ => None,
        })
    }

    fn failure(&self) -> anyhow::Result<RtcError> {
        let wire = self.take("failure", |event| match event {
            Event::Failure(wire) => Some(wire.clone()),
            _ => None,
        })?;
        Ok(RtcError::from_wire(&wire)?)
    }
}

extern "C" fn on_sdp(user_data: *mut c_void, handle: u64) {
    Host::push(user_data, Event::Sdp(handle));
}

extern "C" fn on_done(user_data: *mut c_void) {
    Host::push(user_data, Event::Done);
}

extern "C" fn on_failure(user_data: *mut c_void, error: *const c_char) {
    let wire = unsafe { CStr::from_ptr(error) }.to_string_lossy().into_owned();
    Host::push(user_data, Event::Failure(wire));
}

extern "C" fn on_candidate(user_data: *mut c_void, handle: u64) {
    Host::push(user_data, Event::Candidate(handle));
}

extern "C" fn on_channel(user_data: *mut c_void, handle: u64) {
    Host::push(user_data, Event::Channel(handle));
}

extern "C" fn on_message(user_data: *mut c_void, data: *const u8, len: usize, binary: bool) {
    let bytes = unsafe { std::slice::from_raw_parts(data, len) }.to_vec();
    Host::push(user_data, Event::Message(bytes, binary));
}

extern "C" fn on_stats(user_data: *mut c_void, json: *const c_char) {
    let json = unsafe { CStr::from_ptr(json) }.to_string_lossy().into_owned();
    Host::push(user_data, Event::Stats(json));
}

fn sdp_observer() -> RtcCreateSdpObserver {
    RtcCreateSdpObserver {
        on_success: Some(on_sdp),
        on_failure: Some(on_failure),
    }
}

fn completion_observer() -> RtcCompletionObserver {
    RtcCompletionObserver {
        on_success: Some(on_done),
        on_failure: Some(on_failure),
    }
}

fn peer_observer() -> RtcPeerObserver {
    RtcPeerObserver {
        on_ice_candidate: Some(on_candidate),
        on_data_channel: Some(on_channel),
        ..Default::default()
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn check(error: *mut c_char) -> anyhow::Result<()> {
    if error.is_null() {
        return Ok(());
    }
    let wire = unsafe { CStr::from_ptr(error) }.to_string_lossy().into_owned();
    unsafe { rtc_string_free(error) };
    bail!("call failed: {}", RtcError::from_wire(&wire)?)
}

#[test]
fn test_offer_answer_and_chat_over_handles() -> anyhow::Result<()> {
    let (alice, bob) = (Box::new(Host::default()), Box::new(Host::default()));
    let mut error = ptr::null_mut();

    unsafe {
        let bridge = rtc_bridge_create(ptr::null(), &mut error);
        check(error)?;

        let table = peer_observer();
        let pc_a = rtc_peer_connection_create(bridge, ptr::null(), &table, alice.user_data(), &mut error);
        check(error)?;
        let pc_b = rtc_peer_connection_create(bridge, ptr::null(), &table, bob.user_data(), &mut error);
        check(error)?;

        let label = CString::new("chat")?;
        let chat = rtc_peer_connection_create_data_channel(bridge, pc_a, label.as_ptr(), ptr::null(), &mut error);
        check(error)?;

        rtc_peer_connection_create_offer(bridge, pc_a, ptr::null(), sdp_observer(), alice.user_data());
        let offer = alice.sdp()?;
        assert_eq!(rtc_session_description_type(bridge, offer), 0);

        rtc_peer_connection_set_local_description(bridge, pc_a, offer, completion_observer(), alice.user_data());
        alice.done()?;
        rtc_peer_connection_set_remote_description(bridge, pc_b, offer, completion_observer(), bob.user_data());
        bob.done()?;

        rtc_peer_connection_create_answer(bridge, pc_b, ptr::null(), sdp_observer(), bob.user_data());
        let answer = bob.sdp()?;
        assert_eq!(rtc_session_description_type(bridge, answer), 2);

        rtc_peer_connection_set_local_description(bridge, pc_b, answer, completion_observer(), bob.user_data());
        bob.done()?;
        rtc_peer_connection_set_remote_description(bridge, pc_a, answer, completion_observer(), alice.user_data());
        alice.done()?;

        // Trickle alice's first candidate to bob
        let candidate = alice.take("candidate", |event| match event {
            Event::Candidate(handle) => Some(*handle),
            _ => None,
        })?;
        rtc_peer_connection_add_ice_candidate(bridge, pc_b, candidate, completion_observer(), bob.user_data());
        bob.done()?;

        assert!(wait_for(|| rtc_peer_connection_connection_state(bridge, pc_a) == 2));
        assert_eq!(rtc_peer_connection_signaling_state(bridge, pc_a), 0);

        let remote_chat = bob.take("data channel", |event| match event {
            Event::Channel(handle) => Some(*handle),
            _ => None,
        })?;
        let name = rtc_data_channel_label(bridge, remote_chat, &mut error);
        check(error)?;
        assert_eq!(CStr::from_ptr(name).to_str()?, "chat");
        rtc_string_free(name);

        let channel_table = RtcDataChannelObserver {
            on_message: Some(on_message),
            ..Default::default()
        };
        assert!(rtc_data_channel_register_observer(
            bridge,
            remote_chat,
            &channel_table,
            bob.user_data(),
            &mut error
        ));
        assert!(wait_for(|| rtc_data_channel_state(bridge, chat) == 1));

        let hello = b"hello";
        rtc_data_channel_send_async(bridge, chat, hello.as_ptr(), hello.len(), false, completion_observer(), alice.user_data());
        alice.done()?;
        let received = bob.take("message", |event| match event {
            Event::Message(bytes, binary) => Some((bytes.clone(), *binary)),
            _ => None,
        })?;
        assert_eq!(received, (hello.to_vec(), false));

        assert!(rtc_get_stats(bridge, pc_a, Some(on_stats), alice.user_data(), &mut error));
        let report = alice.take("stats", |event| match event {
            Event::Stats(json) => Some(json.clone()),
            _ => None,
        })?;
        let report: serde_json::Value = serde_json::from_str(&report)?;
        assert!(report["stats"].as_array().is_some_and(|stats| !stats.is_empty()));

        assert!(rtc_data_channel_unregister_observer(bridge, remote_chat, &mut error));
        assert!(rtc_peer_connection_unregister_observer(bridge, pc_a, &mut error));
        assert!(rtc_peer_connection_unregister_observer(bridge, pc_b, &mut error));
        for handle in [pc_a, pc_b, chat, remote_chat, offer, answer, candidate] {
            assert!(rtc_handle_release(bridge, handle), "handle {handle} already gone");
        }
        rtc_bridge_dispose(bridge);
    }
    Ok(())
}

#[test]
fn test_async_calls_fail_exactly_once_on_bad_input() -> anyhow::Result<()> {
    let host = Box::new(Host::default());

    unsafe {
        // No bridge at all
        rtc_peer_connection_create_offer(ptr::null(), 1, ptr::null(), sdp_observer(), host.user_data());
        assert_eq!(host.failure()?.kind(), RtcErrorKind::InvalidParameter);

        let bridge = rtc_bridge_create(ptr::null(), ptr::null_mut());
        assert!(!bridge.is_null());

        rtc_peer_connection_create_offer(bridge, 0, ptr::null(), sdp_observer(), host.user_data());
        assert_eq!(host.failure()?.kind(), RtcErrorKind::InvalidHandle);

        rtc_peer_connection_set_remote_description(bridge, 4242, 4243, completion_observer(), host.user_data());
        assert_eq!(host.failure()?.kind(), RtcErrorKind::InvalidHandle);

        rtc_data_channel_send_async(bridge, 4242, ptr::null(), 0, true, completion_observer(), host.user_data());
        assert_eq!(host.failure()?.kind(), RtcErrorKind::InvalidHandle);

        // Sending a null buffer with a length
        let pc = rtc_peer_connection_create(bridge, ptr::null(), ptr::null(), ptr::null_mut(), ptr::null_mut());
        let label = CString::new("x")?;
        let dc = rtc_peer_connection_create_data_channel(bridge, pc, label.as_ptr(), ptr::null(), ptr::null_mut());
        assert_ne!(dc, 0);
        rtc_data_channel_send_async(bridge, dc, ptr::null(), 4, true, completion_observer(), host.user_data());
        assert_eq!(host.failure()?.kind(), RtcErrorKind::InvalidParameter);

        // A kind mismatch is an invalid handle for the caller, and the
        // callback still gets its one (empty) report
        let mut error = ptr::null_mut();
        assert!(!rtc_get_stats(bridge, dc, Some(on_stats), host.user_data(), &mut error));
        assert!(!error.is_null());
        rtc_string_free(error);
        assert_eq!(host.stats()?, EMPTY_STATS);

        // Stats for a released peer connection
        let gone = rtc_peer_connection_create(bridge, ptr::null(), ptr::null(), ptr::null_mut(), ptr::null_mut());
        assert_ne!(gone, 0);
        assert!(rtc_handle_release(bridge, gone));
        let mut error = ptr::null_mut();
        assert!(!rtc_get_stats(bridge, gone, Some(on_stats), host.user_data(), &mut error));
        let wire = CStr::from_ptr(error).to_string_lossy().into_owned();
        rtc_string_free(error);
        assert_eq!(RtcError::from_wire(&wire)?.kind(), RtcErrorKind::InvalidHandle);
        assert_eq!(host.stats()?, EMPTY_STATS);

        // No bridge at all
        assert!(!rtc_get_stats(ptr::null(), gone, Some(on_stats), host.user_data(), ptr::null_mut()));
        assert_eq!(host.stats()?, EMPTY_STATS);

        rtc_bridge_dispose(bridge);
    }

    std::thread::sleep(Duration::from_millis(50));
    assert!(host.events.lock().is_empty(), "extra callbacks fired");
    Ok(())
}

#[test]
fn test_create_data_channel_init_flags() -> anyhow::Result<()> {
    unsafe {
        let bridge = rtc_bridge_create(ptr::null(), ptr::null_mut());
        let pc = rtc_peer_connection_create(bridge, ptr::null(), ptr::null(), ptr::null_mut(), ptr::null_mut());
        let label = CString::new("telemetry")?;

        let mut init = RtcDataChannelInit {
            ordered: false,
            reliable: true,
            negotiated: true,
            has_id: true,
            id: 3,
            has_max_retransmits: false,
            max_retransmits: 0,
            has_max_retransmit_time: false,
            max_retransmit_time: 0,
            has_priority: true,
            priority: 2,
            protocol: ptr::null(),
        };
        let mut error = ptr::null_mut();
        let dc = rtc_peer_connection_create_data_channel(bridge, pc, label.as_ptr(), &init, &mut error);
        check(error)?;
        assert_eq!(rtc_data_channel_id(bridge, dc), 3);

        // Reliable channels cannot cap retransmissions
        init.has_id = false;
        init.negotiated = false;
        init.has_max_retransmits = true;
        let bad = rtc_peer_connection_create_data_channel(bridge, pc, label.as_ptr(), &init, &mut error);
        assert_eq!(bad, 0);
        assert!(!error.is_null());
        rtc_string_free(error);

        init.has_max_retransmits = false;
        init.priority = 9;
        let bad = rtc_peer_connection_create_data_channel(bridge, pc, label.as_ptr(), &init, &mut error);
        assert_eq!(bad, 0);
        rtc_string_free(error);

        let streams = CString::new(r#"["cam"]"#)?;
        let transceiver = rtc_peer_connection_add_transceiver(bridge, pc, 1, 1, streams.as_ptr(), &mut error);
        check(error)?;
        let sender = rtc_transceiver_sender(bridge, transceiver, &mut error);
        check(error)?;
        let host = Host::default();
        assert!(rtc_get_stats(bridge, sender, Some(on_stats), host.user_data(), &mut error));
        let report = host.take("sender stats", |event| match event {
            Event::Stats(json) => Some(json.clone()),
            _ => None,
        })?;
        assert!(report.starts_with("{\"stats\""));
        assert!(rtc_handle_release(bridge, sender));

        assert!(rtc_peer_connection_close(bridge, pc, &mut error));
        assert_eq!(rtc_peer_connection_signaling_state(bridge, pc), 5);

        rtc_bridge_dispose(bridge);
    }
    Ok(())
}
