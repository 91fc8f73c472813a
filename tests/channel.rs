use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use may::go;
use may_service::channel::{Address, SessionReply};
use may_service::socket::AcceptFn;
use may_service::{Channel, ChannelConfig, Error, ReadResult, SocketId, SocketLayer};

// serve every connection with `handler(nth connection, socket)`
fn server<F>(layer: &SocketLayer, handler: F) -> u16
where
    F: Fn(usize, SocketId, &SocketLayer) + Send + Sync + 'static,
{
    let lid = layer.listen("127.0.0.1", 0).unwrap();
    let port = layer.local_addr(lid).unwrap().port();
    let conns = AtomicUsize::new(0);
    let l = layer.clone();
    let accept: AcceptFn = Arc::new(move |id, _| {
        l.start(id, None).unwrap();
        handler(conns.fetch_add(1, Ordering::Relaxed), id, &l);
        l.close(id);
    });
    layer.start(lid, Some(accept)).unwrap();
    port
}

// answer each line with `<tag> <line>`
fn tagged_echo(layer: &SocketLayer, tag: &'static str) -> u16 {
    server(layer, move |_, id, l| {
        while let Ok(ReadResult::Data(line)) = l.readline(id, b"\n") {
            let rsp = format!("{tag} {}\n", String::from_utf8_lossy(&line));
            if l.write(id, rsp).is_err() {
                break;
            }
        }
    })
}

fn dead_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn fast_retry(config: ChannelConfig) -> ChannelConfig {
    config.retry(Duration::from_millis(10), Duration::from_millis(50))
}

fn line(ch: &Channel, req: &str) -> Result<String, Error> {
    let rsp = ch.request(format!("{req}\n").as_bytes(), |io| io.readline(b"\n"))?;
    Ok(String::from_utf8_lossy(&rsp).into_owned())
}

#[test]
fn requests_resolve_in_order() {
    let layer = SocketLayer::new();
    let accepted = Arc::new(AtomicUsize::new(0));
    let a = accepted.clone();
    let port = server(&layer, move |_, id, l| {
        a.fetch_add(1, Ordering::SeqCst);
        while let Ok(ReadResult::Data(line)) = l.readline(id, b"\n") {
            l.write(id, format!("a {}\n", String::from_utf8_lossy(&line))).ok();
        }
    });
    let ch = Channel::new(&layer, ChannelConfig::new("127.0.0.1", port));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let ch = ch.clone();
            go!(move || line(&ch, &format!("req{i}")).unwrap())
        })
        .collect();
    for (i, h) in handles.into_iter().enumerate() {
        assert_eq!(h.join().unwrap(), format!("a req{i}"));
    }
    // every caller shared one connect attempt and one connection
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    let id = ch.socket().unwrap();
    assert_eq!(line(&ch, "again").unwrap(), "a again");
    assert_eq!(ch.socket(), Some(id));
    ch.close();
}

#[test]
fn falls_back_to_backup() {
    let layer = SocketLayer::new();
    let port = tagged_echo(&layer, "backup");
    let config = ChannelConfig::new("127.0.0.1", dead_port())
        .backup(vec![Address::from(("127.0.0.1", port))]);
    let ch = Channel::new(&layer, fast_retry(config));
    assert_eq!(line(&ch, "x").unwrap(), "backup x");
    ch.close();
}

#[test]
fn connect_once_reports_failure() {
    let layer = SocketLayer::new();
    let ch = Channel::new(&layer, ChannelConfig::new("127.0.0.1", dead_port()));
    assert!(matches!(ch.connect(true), Err(Error::Connect(_))));
    assert_eq!(ch.socket(), None);
}

#[test]
fn failure_fans_out_to_every_waiter() {
    let layer = SocketLayer::new();
    // the first connection swallows three requests and hangs up
    let port = server(&layer, |nth, id, l| {
        if nth == 0 {
            for _ in 0..3 {
                if !matches!(l.readline(id, b"\n"), Ok(ReadResult::Data(_))) {
                    return;
                }
            }
            return;
        }
        while let Ok(ReadResult::Data(line)) = l.readline(id, b"\n") {
            let mut rsp = line.to_vec();
            rsp.push(b'\n');
            l.write(id, rsp).ok();
        }
    });
    let ch = Channel::new(&layer, fast_retry(ChannelConfig::new("127.0.0.1", port)));
    ch.connect(true).unwrap();

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let ch = ch.clone();
            go!(move || line(&ch, &format!("lost{i}")))
        })
        .collect();
    for h in handles {
        assert!(matches!(h.join().unwrap(), Err(Error::Socket(_))));
    }

    // the next request brings up a new connection
    assert_eq!(line(&ch, "back").unwrap(), "back");
    ch.close();
}

#[test]
fn rejected_keeps_connection() {
    let layer = SocketLayer::new();
    let port = server(&layer, |_, id, l| {
        while let Ok(ReadResult::Data(line)) = l.readline(id, b"\n") {
            let rsp = if &line[..] == b"bad" {
                "-ERR bad\n".to_owned()
            } else {
                format!("+{}\n", String::from_utf8_lossy(&line))
            };
            l.write(id, rsp).ok();
        }
    });
    let ch = Channel::new(&layer, ChannelConfig::new("127.0.0.1", port));
    let status = |ch: &Channel, req: &str| {
        ch.request(format!("{req}\n").as_bytes(), |io| {
            let line = io.readline(b"\n")?;
            match line.first() {
                Some(b'+') => Ok(line.slice(1..)),
                _ => Err(Error::Rejected(String::from_utf8_lossy(&line[1..]).into_owned())),
            }
        })
    };

    assert_eq!(status(&ch, "ok").unwrap(), Bytes::from_static(b"ok"));
    let id = ch.socket();
    assert!(matches!(status(&ch, "bad"), Err(Error::Rejected(msg)) if msg == "ERR bad"));
    assert_eq!(status(&ch, "fine").unwrap(), Bytes::from_static(b"fine"));
    assert_eq!(ch.socket(), id);
    ch.close();
}

#[test]
fn auth_failure_moves_to_next_host() {
    let layer = SocketLayer::new();
    let greet = |greeting: &'static str, tag: &'static str| {
        move |_: usize, id: SocketId, l: &SocketLayer| {
            l.write(id, greeting).ok();
            while let Ok(ReadResult::Data(line)) = l.readline(id, b"\n") {
                l.write(id, format!("{tag} {}\n", String::from_utf8_lossy(&line))).ok();
            }
        }
    };
    let primary = server(&layer, greet("go away\n", "primary"));
    let backup = server(&layer, greet("hello\n", "backup"));

    let config = ChannelConfig::new("127.0.0.1", primary)
        .backup(vec![Address::from(("127.0.0.1", backup))])
        .auth(|ch| {
            let greeting = ch.response(|io| io.readline(b"\n"))?;
            match &greeting[..] {
                b"hello" => Ok(()),
                _ => Err(Error::Rejected("unexpected greeting".to_owned())),
            }
        });
    let ch = Channel::new(&layer, fast_retry(config));
    assert_eq!(line(&ch, "who").unwrap(), "backup who");
    ch.close();
}

#[test]
fn change_host_reconnects_elsewhere() {
    let layer = SocketLayer::new();
    let a = tagged_echo(&layer, "a");
    let b = tagged_echo(&layer, "b");
    let ch = Channel::new(&layer, ChannelConfig::new("127.0.0.1", a));
    assert_eq!(line(&ch, "1").unwrap(), "a 1");

    ch.change_host("127.0.0.1", Some(b));
    assert_eq!(ch.socket(), None);
    assert_eq!(line(&ch, "2").unwrap(), "b 2");
    assert_eq!(ch.host(), ("127.0.0.1".to_owned(), b));
    ch.close();
}

#[test]
fn session_replies_out_of_order() {
    let layer = SocketLayer::new();
    // collect two `<session> <payload>` lines, answer them in reverse
    let port = server(&layer, |_, id, l| {
        let mut pending = Vec::new();
        while let Ok(ReadResult::Data(line)) = l.readline(id, b"\n") {
            pending.push(String::from_utf8_lossy(&line).into_owned());
            if pending.len() < 2 {
                continue;
            }
            for req in pending.drain(..).rev() {
                let (session, payload) = req.split_once(' ').unwrap();
                let rsp = if payload == "fail" {
                    format!("{session} - nope\n")
                } else {
                    format!("{session} + {}\n", payload.to_uppercase())
                };
                l.write(id, rsp).ok();
            }
        }
    });
    let config = ChannelConfig::new("127.0.0.1", port).session_reader(|io| {
        let line = io.readline(b"\n")?;
        let text = String::from_utf8_lossy(&line).into_owned();
        let mut parts = text.splitn(3, ' ');
        let session = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Socket(format!("bad reply {text}")))?;
        let ok = parts.next() == Some("+");
        let data = Bytes::from(parts.next().unwrap_or_default().to_owned());
        Ok(SessionReply { session, ok, data })
    });
    let ch = Channel::new(&layer, config);

    let c = ch.clone();
    let first = go!(move || c.request_session(b"1 first\n", 1));
    let c = ch.clone();
    let second = go!(move || c.request_session(b"2 second\n", 2));
    assert_eq!(first.join().unwrap().unwrap(), Bytes::from_static(b"FIRST"));
    assert_eq!(second.join().unwrap().unwrap(), Bytes::from_static(b"SECOND"));

    let c = ch.clone();
    let failed = go!(move || c.request_session(b"3 fail\n", 3));
    let ok = ch.request_session(b"4 fine\n", 4).unwrap();
    assert_eq!(ok, Bytes::from_static(b"FINE"));
    assert!(matches!(failed.join().unwrap(), Err(Error::Rejected(msg)) if msg == "nope"));
    ch.close();
}

#[test]
fn close_fails_pending_request() {
    let layer = SocketLayer::new();
    // never answers
    let port = server(&layer, |_, id, l| {
        l.readall(id).ok();
    });
    let ch = Channel::new(&layer, ChannelConfig::new("127.0.0.1", port));
    ch.connect(true).unwrap();
    let c = ch.clone();
    let h = go!(move || line(&c, "hang"));
    may::coroutine::sleep(Duration::from_millis(50));
    assert!(!h.is_done());
    ch.close();
    assert!(h.join().unwrap().is_err());
    assert!(matches!(line(&ch, "after"), Err(Error::ChannelClosed)));
}

#[test]
fn close_reaches_callers_sharing_an_attempt() {
    let layer = SocketLayer::new();
    let ch = Channel::new(&layer, fast_retry(ChannelConfig::new("127.0.0.1", dead_port())));
    let c = ch.clone();
    let leader = go!(move || c.connect(false));
    may::coroutine::sleep(Duration::from_millis(30));
    let c = ch.clone();
    let follower = go!(move || line(&c, "x"));
    may::coroutine::sleep(Duration::from_millis(30));

    ch.close();
    assert!(matches!(leader.join().unwrap(), Err(Error::ChannelClosed)));
    assert!(matches!(follower.join().unwrap(), Err(Error::ChannelClosed)));
}

#[test]
fn retrying_caller_outlives_one_pass_attempt() {
    let layer = SocketLayer::new();
    let port = tagged_echo(&layer, "a");
    let auths = Arc::new(AtomicUsize::new(0));
    let n = auths.clone();
    let config = ChannelConfig::new("127.0.0.1", port).auth(move |_| {
        if n.fetch_add(1, Ordering::SeqCst) == 0 {
            may::coroutine::sleep(Duration::from_millis(200));
            return Err(Error::Rejected("not yet".to_owned()));
        }
        Ok(())
    });
    let ch = Channel::new(&layer, fast_retry(config));

    let c = ch.clone();
    let once = go!(move || c.connect(true));
    while auths.load(Ordering::SeqCst) == 0 {
        may::coroutine::sleep(Duration::from_millis(1));
    }
    // joins the attempt above, which gives up after its first pass
    let c = ch.clone();
    let retry = go!(move || line(&c, "late"));

    assert!(once.join().unwrap().is_err());
    assert_eq!(retry.join().unwrap().unwrap(), "a late");
    assert_eq!(auths.load(Ordering::SeqCst), 2);
    ch.close();
}

#[test]
fn change_backup_reconnects_elsewhere() {
    let layer = SocketLayer::new();
    let first = tagged_echo(&layer, "first");
    let second = tagged_echo(&layer, "second");
    let config = ChannelConfig::new("127.0.0.1", dead_port())
        .backup(vec![Address::from(("127.0.0.1", first))]);
    let ch = Channel::new(&layer, fast_retry(config));
    assert_eq!(line(&ch, "1").unwrap(), "first 1");

    ch.change_backup(vec![Address::from(("127.0.0.1", second))]);
    assert_eq!(ch.socket(), None);
    assert_eq!(line(&ch, "2").unwrap(), "second 2");
    ch.close();
}

#[test]
fn send_expects_no_reply() {
    let layer = SocketLayer::new();
    // count `fire` lines, answer `ask` with the count
    let port = server(&layer, |_, id, l| {
        let mut fired = 0;
        while let Ok(ReadResult::Data(line)) = l.readline(id, b"\n") {
            match &line[..] {
                b"fire" => fired += 1,
                _ => {
                    l.write(id, format!("{fired}\n")).ok();
                }
            }
        }
    });
    let ch = Channel::new(&layer, ChannelConfig::new("127.0.0.1", port));
    ch.send(b"fire\n").unwrap();
    ch.send(b"fire\n").unwrap();
    assert_eq!(line(&ch, "ask").unwrap(), "2");
    ch.close();
}

#[test]
fn request_in_parts() {
    let layer = SocketLayer::new();
    let port = tagged_echo(&layer, "got");
    let ch = Channel::new(&layer, ChannelConfig::new("127.0.0.1", port));
    let parts: [&[u8]; 2] = [b"payload ", b"tail\n"];
    let rsp = ch
        .request_parts(b"big ", &parts, |io| io.readline(b"\n"))
        .unwrap();
    assert_eq!(rsp, Bytes::from_static(b"got big payload tail"));
    ch.close();
}
