//! a line protocol client going through a reconnecting channel
//!
//! the server greets every connection with `hello`, then upper-cases each
//! line it receives. The channel's primary address is dead, so it falls back
//! to the backup and checks the greeting before handing out the connection.
use std::sync::Arc;

use may_service::channel::Address;
use may_service::socket::AcceptFn;
use may_service::{Channel, ChannelConfig, Error, ReadResult, SocketLayer};

fn serve_lines(layer: &SocketLayer) -> u16 {
    let lid = layer.listen("127.0.0.1", 0).unwrap();
    let port = layer.local_addr(lid).unwrap().port();
    let l = layer.clone();
    let accept: AcceptFn = Arc::new(move |id, peer| {
        println!("server: accept {peer}");
        if l.start(id, None).is_err() {
            return;
        }
        l.write(id, "hello\n").ok();
        while let Ok(ReadResult::Data(line)) = l.readline(id, b"\n") {
            let mut rsp = line.to_ascii_uppercase();
            rsp.push(b'\n');
            if l.write(id, rsp).is_err() {
                break;
            }
        }
        l.close(id);
    });
    layer.start(lid, Some(accept)).unwrap();
    port
}

fn main() {
    env_logger::init();
    let layer = SocketLayer::new();
    let port = serve_lines(&layer);

    // nothing listens on port 1
    let config = ChannelConfig::new("127.0.0.1", 1)
        .backup(vec![Address::from(("127.0.0.1", port))])
        .nodelay(true)
        .auth(|ch| {
            let greeting = ch.response(|io| io.readline(b"\n"))?;
            if &greeting[..] != b"hello" {
                return Err(Error::Rejected("bad greeting".to_owned()));
            }
            Ok(())
        });
    let channel = Channel::new(&layer, config);

    let mut tasks = Vec::new();
    for i in 0..4 {
        let ch = channel.clone();
        tasks.push(may::go!(move || {
            let line = format!("request {i}\n");
            let rsp = ch.request(line.as_bytes(), |io| io.readline(b"\n"));
            println!("client {i}: {:?}", rsp.map(|b| String::from_utf8_lossy(&b).into_owned()));
        }));
    }
    for t in tasks {
        t.join().ok();
    }
    println!("connected through {:?}", channel.socket());
    channel.close();
}
