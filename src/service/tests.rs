use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use may::go;

use super::*;
use crate::node::Node;
use crate::protocol::{Protocol, PTYPE_NAME_TEXT};

fn pong_node() -> (Node, Service, Service) {
    let node = Node::new();
    let a = node.launch(Some("a"), |_| Ok(())).unwrap();
    let b = node
        .launch(Some("b"), |svc| {
            svc.dispatch(PTYPE_NAME_LUA, |svc, ctx, args| {
                assert_eq!(args, vec![Value::from("ping")]);
                svc.ret(ctx, &["pong".into()]).map(|_| ())
            })?;
            Ok(())
        })
        .unwrap();
    (node, a, b)
}

#[test]
fn call_resolves_and_cleans_both_sides() {
    let (_node, a, b) = pong_node();
    let rsp = a.call(b.addr(), PTYPE_NAME_LUA, &["ping".into()]).unwrap();
    assert_eq!(rsp, vec![Value::from("pong")]);
    assert_eq!(a.task_count(), 0);
    assert_eq!(b.pending_replies(), 0);
}

#[test]
fn concurrent_calls_use_distinct_sessions() {
    let (_node, a, b) = pong_node();
    let dest = b.addr();
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let a = a.clone();
            go!(move || a.call(dest, PTYPE_NAME_LUA, &["ping".into()]).unwrap())
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), vec![Value::from("pong")]);
    }
    assert_eq!(a.task_count(), 0);
}

#[test]
fn deferred_response() {
    let node = Node::new();
    let a = node.launch(None, |_| Ok(())).unwrap();
    let b = node
        .launch(None, |svc| {
            svc.dispatch(PTYPE_NAME_LUA, |svc, ctx, args| {
                let rsp = svc.response(ctx);
                go!(move || {
                    may::coroutine::sleep(Duration::from_millis(10));
                    assert!(rsp.ok(&args).unwrap());
                    // only the first reply is sent
                    assert!(!rsp.ok(&args).unwrap());
                    assert!(!rsp.is_pending());
                });
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();
    let rsp = a.call(b.addr(), PTYPE_NAME_LUA, &[Value::Int(7)]).unwrap();
    assert_eq!(rsp, vec![Value::Int(7)]);
}

#[test]
fn responder_fail_and_drop_report_errors() {
    let node = Node::new();
    let a = node.launch(None, |_| Ok(())).unwrap();
    let b = node
        .launch(None, |svc| {
            svc.dispatch(PTYPE_NAME_LUA, |svc, ctx, args| {
                let rsp = svc.response(ctx);
                if args.first().and_then(Value::as_bool) == Some(true) {
                    rsp.fail()?;
                }
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();
    let err = a.call(b.addr(), PTYPE_NAME_LUA, &[true.into()]).unwrap_err();
    assert!(matches!(err, Error::CallFailed { .. }));
    let err = a.call(b.addr(), PTYPE_NAME_LUA, &[false.into()]).unwrap_err();
    assert!(matches!(err, Error::CallFailed { .. }));
    assert_eq!(b.pending_replies(), 0);
}

#[test]
fn forgotten_reply_fails_the_caller() {
    let node = Node::new();
    let a = node.launch(None, |_| Ok(())).unwrap();
    let b = node
        .launch(None, |svc| {
            svc.dispatch(PTYPE_NAME_LUA, |_, _, _| Ok(()))?;
            Ok(())
        })
        .unwrap();
    let err = a.call(b.addr(), PTYPE_NAME_LUA, &[]).unwrap_err();
    assert!(matches!(err, Error::CallFailed { session, .. } if session != 0));
    assert_eq!(a.task_count(), 0);
}

#[test]
fn call_to_missing_service() {
    let node = Node::new();
    let a = node.launch(None, |_| Ok(())).unwrap();
    let err = a.call(Addr(1000), PTYPE_NAME_LUA, &[]).unwrap_err();
    assert!(matches!(err, Error::Send(SendError::NoDestination(Addr(1000)))));
    assert_eq!(a.task_count(), 0);
}

#[test]
fn dying_callee_fails_pending_call() {
    let node = Node::new();
    let a = node.launch(None, |_| Ok(())).unwrap();
    let b = node
        .launch(None, |svc| {
            svc.dispatch(PTYPE_NAME_LUA, |svc, _, _| {
                // never replies
                let token = svc.gen_token();
                svc.wait(token)
            })?;
            Ok(())
        })
        .unwrap();

    let b_addr = b.addr();
    let caller = a.clone();
    let h = go!(move || caller.call(b_addr, PTYPE_NAME_LUA, &[]));
    while b.pending_replies() == 0 {
        may::coroutine::sleep(Duration::from_millis(1));
    }
    b.exit();
    let err = h.join().unwrap().unwrap_err();
    assert!(matches!(err, Error::CallFailed { .. }));
    assert_eq!(a.task_count(), 0);
}

#[test]
fn peer_down_fails_calls_to_it() {
    let node = Node::new();
    let a = node.launch(None, |_| Ok(())).unwrap();
    let b = node
        .launch(None, |svc| {
            svc.dispatch(PTYPE_NAME_LUA, |svc, ctx, _| {
                // hold the reply, then report this service as down
                svc.ignore_ret(ctx.source, ctx.session);
                svc.reply_error(ctx.source, 0);
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();
    let err = a.call(b.addr(), PTYPE_NAME_LUA, &[]).unwrap_err();
    assert!(matches!(err, Error::CallFailed { .. }));
}

#[test]
fn wakeup_ends_sleep_early() {
    let node = Node::new();
    let a = node.launch(None, |_| Ok(())).unwrap();
    assert!(!a.wakeup(12345));

    let token = a.gen_token();
    let sleeper = a.clone();
    let h = go!(move || sleeper.sleep_with(Duration::from_secs(3600), token).unwrap());
    while !a.wakeup(token) {
        may::coroutine::sleep(Duration::from_millis(1));
    }
    assert!(h.join().unwrap());
    // the broken timer keeps its session until the timer response arrives
    assert_eq!(a.task_count(), 1);
    assert!(!a.wakeup(token));
}

#[test]
fn sleep_and_timeout() {
    let node = Node::new();
    let a = node.launch(None, |_| Ok(())).unwrap();
    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    a.timeout(Duration::from_millis(10), move || f.store(true, Ordering::Release));
    a.sleep(Duration::from_millis(50)).unwrap();
    assert!(fired.load(Ordering::Acquire));
    assert_eq!(a.task_count(), 0);
}

#[test]
fn unknown_request_hook() {
    let node = Node::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let s = seen.clone();
    let b = node
        .launch(None, move |svc| {
            let prev = svc.dispatch_unknown_request(move |_, _, _, msg, proto| {
                assert_eq!(proto, 1);
                s.fetch_add(msg.len(), Ordering::Relaxed);
                Ok(())
            });
            drop(prev);
            Ok(())
        })
        .unwrap();
    let a = node.launch(None, |_| Ok(())).unwrap();

    // no text handler, fire-and-forget goes to the hook
    a.send(b.addr(), PTYPE_NAME_TEXT, &["hello".into()]).unwrap();
    // a request with a session is error-replied instead
    let err = a.call(b.addr(), PTYPE_NAME_TEXT, &["x".into()]).unwrap_err();
    assert!(matches!(err, Error::CallFailed { .. }));
    assert_eq!(seen.load(Ordering::Relaxed), 5);
}

#[test]
fn custom_protocol_and_replaced_dispatch() {
    let node = Node::new();
    let b = node
        .launch(None, |svc| {
            svc.register_protocol(Protocol::new("echo", 42).dispatch(|svc, ctx, args| {
                svc.ret(ctx, &args).map(|_| ())
            }))?;
            let dup = svc.register_protocol(Protocol::new("echo", 43));
            assert!(matches!(dup, Err(Error::DuplicateProtocol { .. })));
            Ok(())
        })
        .unwrap();
    let a = node.launch(None, |svc| svc.register_protocol(Protocol::new("echo", 42))).unwrap();

    let rsp = a.call(b.addr(), "echo", &[Value::Int(1)]).unwrap();
    assert_eq!(rsp, vec![Value::Int(1)]);

    let prev = b
        .dispatch("echo", |svc, ctx, _| svc.ret(ctx, &[Value::Nil]).map(|_| ()))
        .unwrap();
    assert!(prev.is_some());
    let rsp = a.call(b.addr(), "echo", &[Value::Int(1)]).unwrap();
    assert_eq!(rsp, vec![Value::Nil]);
}

#[test]
fn exit_is_idempotent() {
    let node = Node::new();
    let a = node.launch(None, |_| Ok(())).unwrap();
    a.exit();
    a.exit();
    assert!(a.is_exited());
    assert!(node.services().is_empty());
}
