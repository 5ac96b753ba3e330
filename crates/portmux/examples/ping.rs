//! Ping example: a shared "worker" answering two protocols over a hub.
//!
//! `first` answers once after a second; `second` ticks every second until
//! the worker stops it after five seconds, so its caller sees
//! `AbortChannel`.
//!
//! Run with:
//!   PORTMUX_LOG=debug cargo run --example ping

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use portmux::logging;
use portmux::protocol::BoxError;
use portmux::transport::MemoryHub;
use portmux::{PortSource, Protocol, ReplyStream, Services};

fn ticks(prefix: &'static str, limit: Option<u64>) -> ReplyStream<String> {
    stream::unfold(0u64, move |i| async move {
        if limit.is_some_and(|limit| i >= limit) {
            return None;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        Some((Ok::<_, BoxError>(format!("{prefix} {i}")), i + 1))
    })
    .boxed()
}

async fn call(label: &str, protocol: &Protocol<String, String>, source: PortSource, payload: &str) {
    let mut replies = protocol.requester(source).request(&payload.to_string());
    while let Some(reply) = replies.next().await {
        match reply {
            Ok(value) => eprintln!(">> {label} - N {value}"),
            Err(err) => {
                eprintln!(">> {label} - E {err}");
                return;
            }
        }
    }
    eprintln!(">> {label} - C");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_from_env()?;

    let services = Arc::new(Services::local());
    let first: Protocol<String, String> = Protocol::new("first", services.clone());
    let second: Protocol<String, String> = Protocol::new("second", services.clone());

    // worker side
    let hub = MemoryHub::new();
    let clients = PortSource::broadcast(services.watch_hub(&hub));
    let _first_handle = first.responder(clients.clone()).serve(|payload: String| {
        eprintln!("F {payload}");
        Some(ticks("F", Some(1)))
    });
    let second_handle = second.responder(clients).serve(|payload: String| {
        eprintln!("S {payload}");
        Some(ticks("S", None))
    });
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        second_handle.stop();
    });

    // main side
    let port = PortSource::fixed(hub.connect());
    tokio::join!(
        call("FIRST", &first, port.clone(), "ping 1"),
        call("SECOND", &second, port, "ping 2"),
    );
    Ok(())
}
