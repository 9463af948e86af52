//! Corner cases: fatal invariant violations and destructor policy.

use std::sync::atomic::{AtomicBool, AtomicUsize};

use super::*;
use crate::nexus::{bg_thread_main, BgThreadCtx};
use crate::util::mt_list::MtList;
use crate::util::tls_registry::TlsRegistry;

/// A background worker whose Nexus-assigned index disagrees with its tiny
/// thread id dies with a mismatch diagnostic.
#[test]
fn bg_tid_mismatch_is_fatal() {
    let registry = Arc::new(TlsRegistry::new());

    // Claim tiny tid 0 elsewhere, so the worker below gets tid 1.
    {
        let registry = registry.clone();
        thread::spawn(move || registry.init()).join().unwrap();
    }

    let ctx: BgThreadCtx<FakeTransport> = BgThreadCtx {
        index: 2,
        kill_switch: Arc::new(AtomicBool::new(false)),
        tls_registry: registry,
        req_funcs: Arc::new(ReqFuncTable::new()),
        req_list: Arc::new(MtList::new()),
        ready: Arc::new(AtomicUsize::new(0)),
    };
    let result = thread::spawn(move || bg_thread_main(ctx)).join();
    let panic_msg = *result.unwrap_err().downcast::<String>().unwrap();
    assert!(panic_msg.contains("background thread id mismatch"));
}

/// Destroying an Rpc from a thread other than its creator is fatal.
#[test]
fn drop_from_wrong_thread_is_fatal() {
    let _guard = test_guard();
    let nx = Nexus::<FakeTransport>::new("127.0.0.1", next_port(), 0, ReqFuncTable::new()).unwrap();

    let rpc = Rpc::new(&nx, std::ptr::null_mut(), 1, sm_ignore(), 1, 0).unwrap();
    let raw = Box::into_raw(Box::new(rpc)) as usize;

    // `Rpc` is deliberately not `Send`; smuggle the pointer to model a
    // misbehaving application.
    let result = thread::spawn(move || {
        // SAFETY: the box is leaked above and reconstituted exactly once.
        drop(unsafe { Box::from_raw(raw as *mut Rpc<FakeTransport>) });
    })
    .join();
    assert!(result.is_err());
}

/// Destroying an Rpc that still has a live session is fatal: every session
/// must have reached `Disconnected` (and been buried) first.
#[test]
fn drop_with_live_session_is_fatal() {
    let _guard = test_guard();
    let nx = Nexus::<FakeTransport>::new("127.0.0.1", next_port(), 0, ReqFuncTable::new()).unwrap();

    let rpc = Rpc::new(&nx, std::ptr::null_mut(), 1, sm_ignore(), 1, 0).unwrap();
    rpc.create_session("127.0.0.1", 9).unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || drop(rpc)));
    let panic_msg = *result.unwrap_err().downcast::<String>().unwrap();
    assert!(panic_msg.contains("live session"));
}

/// Disconnect preconditions: wrong state and busy sessions are rejected.
#[test]
fn disconnect_preconditions() {
    let _guard = test_guard();
    let nx = Nexus::<FakeTransport>::new("127.0.0.1", next_port(), 0, ReqFuncTable::new()).unwrap();

    let ctx = TestCtx::default();
    let client = Rpc::new(&nx, ctx.as_ptr(), 1, sm_recorder(), 1, 0).unwrap();
    let server = Rpc::new(&nx, std::ptr::null_mut(), 2, sm_ignore(), 1, 0).unwrap();

    // Still connecting: cannot disconnect yet.
    let sess = client.create_session("127.0.0.1", 2).unwrap();
    assert!(matches!(
        client.disconnect_session(sess),
        Err(Error::InvalidSessState(_))
    ));

    pump_until(&[&client, &server], "connect", || !ctx.sm_events().is_empty());
    client.disconnect_session(sess).unwrap();

    // Already disconnecting: a second call is rejected.
    assert!(matches!(
        client.disconnect_session(sess),
        Err(Error::InvalidSessState(_))
    ));
    pump_until(&[&client, &server], "disconnect", || {
        ctx.sm_events().len() == 2
    });
}
