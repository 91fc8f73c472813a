#![feature(test)]

#[cfg(test)]
extern crate test;
#[cfg(test)]
use test::Bencher;

use may_service::{Node, Value};

#[may_service::service]
trait Ack {
    fn ack(&self);
}

#[derive(may_service::Server)]
#[service(Ack)]
struct Server;

impl Ack for Server {
    fn ack(&self) {}
}

#[cfg(test)]
#[bench]
fn call_latency(bencher: &mut Bencher) {
    let node = Node::new();
    let server = node.launch(None, |svc| svc.serve("lua", Server)).unwrap();
    let caller = node.launch(None, |_| Ok(())).unwrap();
    let client = AckClient::new(caller, server.addr());

    bencher.iter(|| {
        client.ack().unwrap();
    });
}

#[cfg(test)]
#[bench]
fn text_call_latency(bencher: &mut Bencher) {
    let node = Node::new();
    let server = node
        .launch(None, |svc| {
            svc.dispatch("text", |svc, ctx, args| svc.ret(ctx, &args).map(|_| ()))?;
            Ok(())
        })
        .unwrap();
    let caller = node.launch(None, |_| Ok(())).unwrap();
    let args = [Value::from("ping")];

    bencher.iter(|| {
        caller.call(server.addr(), "text", &args).unwrap();
    });
}
