//! Plugin and kernel engines over loopback TCP

mod common;

use anvil_rpc::{CallArgs, Endpoint, Engine, TcpAcceptor, TcpConnector};
use serde_json::{json, Value};
use std::sync::Arc;

#[test]
fn test_plugin_calls_kernel_over_tcp() {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0").unwrap();
    let addr = acceptor.local_addr().unwrap();

    let kernel = Engine::new(common::kernel_config());
    let (seen_tx, seen_rx) = flume::unbounded();
    kernel.bind("connect", move |args: CallArgs| {
        let _ = seen_tx.send(args.kw("service").cloned());
        Ok(Value::Null)
    });
    kernel.bind("env", |_args: CallArgs| Ok(json!({"WORLD": "overworld"})));
    let kernel_io = kernel.spawn(Arc::new(acceptor)).unwrap();

    let mut config = common::plugin_config();
    config.endpoint = Endpoint::Tcp(addr.to_string());
    let plugin = Engine::new(config);
    plugin.bind("test", |_args: CallArgs| Ok(json!("CLI: 0")));
    let plugin_io = plugin.spawn(Arc::new(TcpConnector::new(addr.to_string()))).unwrap();
    assert!(plugin.wait_ready());

    let env = plugin
        .service("kernel")
        .sync()
        .attr("env")
        .call(CallArgs::new())
        .unwrap();
    assert_eq!(env, json!({"WORLD": "overworld"}));

    let seen = seen_rx.recv_timeout(common::WAIT).unwrap();
    assert_eq!(seen, Some(json!("test-plugin")));

    let reply = kernel
        .service("test-plugin")
        .sync()
        .attr("test")
        .call(CallArgs::new())
        .unwrap();
    assert_eq!(reply, json!("CLI: 0"));

    plugin.close();
    plugin_io.join().unwrap().unwrap();
    kernel.close();
    kernel_io.join().unwrap().unwrap();
}
