use std::sync::{Arc, Mutex};

use may::go;
use may_service::{Error, Node, Responder, Value};

#[may_service::service]
trait Counter {
    fn add(&self, x: u32, y: u32) -> u32;
    fn greet(&self, name: String) -> String;
}

#[derive(may_service::Server)]
#[service(Counter)]
struct CounterImpl;

impl Counter for CounterImpl {
    fn add(&self, x: u32, y: u32) -> u32 {
        x + y
    }

    fn greet(&self, name: String) -> String {
        format!("hello {name}")
    }
}

#[test]
fn generated_client_round_trip() {
    let node = Node::new();
    let server = node
        .launch(Some("counter"), |svc| svc.serve("lua", CounterImpl))
        .unwrap();
    let caller = node.launch(None, |_| Ok(())).unwrap();
    let client = CounterClient::new(caller.clone(), node.query("counter").unwrap());

    assert_eq!(client.add(40, 2).unwrap(), 42);
    assert_eq!(client.greet("node".into()).unwrap(), "hello node");
    assert_eq!(caller.task_count(), 0);
    assert_eq!(server.pending_replies(), 0);

    node.kill(server.addr());
    assert!(client.add(1, 1).is_err());
}

#[test]
fn ping_pong_between_services() {
    let node = Node::new();
    let pong = node
        .launch(Some("pong"), |svc| {
            svc.dispatch("text", |svc, ctx, args| {
                let n: i64 = args[0].as_str().and_then(|s| s.parse().ok()).unwrap_or(-1);
                svc.ret(ctx, &[Value::from((n + 1).to_string())])?;
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();

    // ping bounces a counter off pong from inside its own handler
    let ping = node
        .launch(Some("ping"), move |svc| {
            let dest = pong.addr();
            svc.dispatch("text", move |svc, ctx, args| {
                let mut n: i64 = args[0].as_str().and_then(|s| s.parse().ok()).unwrap_or(0);
                for _ in 0..10 {
                    let rsp = svc.call(dest, "text", &[Value::from(n.to_string())])?;
                    n = rsp[0].as_str().and_then(|s| s.parse().ok()).unwrap_or(-1);
                }
                svc.ret(ctx, &[Value::from(n.to_string())])?;
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();

    let main = node.launch(None, |_| Ok(())).unwrap();
    let rsp = main.call(ping.addr(), "text", &[Value::from("5")]).unwrap();
    assert_eq!(rsp[0].as_str(), Some("15"));
}

#[test]
fn three_callers_answered_together() {
    let node = Node::new();
    // hold every request until three arrived, then answer all of them
    let held: Arc<Mutex<Vec<(Responder, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let h = held.clone();
    let gate = node
        .launch(None, move |svc| {
            svc.dispatch("lua", move |svc, ctx, args| {
                let n = args[0].as_int().unwrap_or_default();
                let ready = {
                    let mut held = h.lock().unwrap();
                    held.push((svc.response(ctx), n));
                    if held.len() < 3 {
                        return Ok(());
                    }
                    std::mem::take(&mut *held)
                };
                for (r, n) in ready {
                    r.ok(&[Value::from(n * 10)])?;
                }
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();

    let dest = gate.addr();
    let handles: Vec<_> = (1..=3)
        .map(|i: i64| {
            let caller = node.launch(None, |_| Ok(())).unwrap();
            go!(move || caller.call(dest, "lua", &[Value::from(i)]).unwrap())
        })
        .collect();
    let mut got: Vec<i64> = handles
        .into_iter()
        .map(|h| h.join().unwrap()[0].as_int().unwrap())
        .collect();
    got.sort_unstable();
    assert_eq!(got, vec![10, 20, 30]);
    assert_eq!(gate.pending_replies(), 0);
    assert!(held.lock().unwrap().is_empty());
}

#[test]
fn dead_destination() {
    let node = Node::new();
    let gone = node.launch(None, |_| Ok(())).unwrap();
    let addr = gone.addr();
    gone.exit();

    let caller = node.launch(None, |_| Ok(())).unwrap();
    match caller.call(addr, "lua", &[Value::from(1)]) {
        Err(Error::Send(_)) | Err(Error::CallFailed { .. }) => {}
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(caller.task_count(), 0);
}
