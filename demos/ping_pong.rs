//! two services trading text messages
//!
//! `pong` answers every request, `ping` calls it a few times, naps between
//! calls and finally shows a deferred reply answered from a timer.
use std::time::Duration;

use may_service::{Node, Value};

fn main() {
    env_logger::init();
    let node = Node::new();

    let pong = node
        .launch(Some("pong"), |svc| {
            svc.dispatch("text", |svc, ctx, args| {
                let msg = args[0].as_str().unwrap_or_default().to_owned();
                if msg == "later" {
                    // answer from another task once the timer fires
                    let responder = svc.response(ctx);
                    svc.timeout(Duration::from_millis(50), move || {
                        responder.ok(&[Value::from("late pong")]).ok();
                    });
                    return Ok(());
                }
                svc.ret(ctx, &[Value::from(format!("pong: {msg}"))])?;
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();

    let ping = node.launch(Some("ping"), |_| Ok(())).unwrap();
    let dest = node.query("pong").unwrap();
    assert_eq!(dest, pong.addr());

    for i in 0..5 {
        let rsp = ping.call(dest, "text", &[Value::from(format!("ping {i}"))]).unwrap();
        println!("{} <- {}", ping.addr(), rsp[0]);
        ping.sleep(Duration::from_millis(10)).unwrap();
    }

    let rsp = ping.call(dest, "text", &[Value::from("later")]).unwrap();
    println!("{} <- {}", ping.addr(), rsp[0]);

    node.kill(pong.addr());
    match ping.call(dest, "text", &[Value::from("anyone?")]) {
        Ok(rsp) => println!("unexpected reply {rsp:?}"),
        Err(e) => println!("pong is gone: {e}"),
    }
    ping.exit();
}
