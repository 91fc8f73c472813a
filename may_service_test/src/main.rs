use may_service::Node;

mod test_hello;

fn test_hello(node: &Node) {
    use test_hello::{HelloClient, HelloService};

    let server = node
        .launch(Some("hello"), |svc| svc.serve("lua", HelloService))
        .unwrap();

    let caller = node.launch(None, |_| Ok(())).unwrap();
    let dest = node.query("hello").unwrap();
    assert_eq!(dest, server.addr());
    let client = HelloClient::new(caller.clone(), dest);

    for i in 0..10 {
        let s = format!("Hello World! id={}", i);
        let data = client.echo(s);
        println!("recv = {:?}", data);
    }

    for i in 0..10 {
        let data = client.add(i, i);
        println!("recv = {:?}", data);
    }

    node.kill(server.addr());
    println!("after kill = {:?}", client.add(1, 1));
    caller.exit();
}

fn main() {
    env_logger::init();

    let node = Node::new();
    test_hello(&node);
}
