//! Newline-delimited JSON-RPC server with a shared key/value store.
//!
//! Try it:
//!
//! ```text
//! $ nc 127.0.0.1 9090
//! {"SetValue":{"key":"greeting","value":"hi"}}
//! {"ValueSet":{"key":"greeting"}}
//! {"GetValue":{"key":"greeting"}}
//! {"Value":{"key":"greeting","value":"hi"}}
//! ```

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lockfree::map::Map;
use serde::{Deserialize, Serialize};

use sluice::{Reactor, TcpServer, TcpServerConfig};

#[derive(Serialize, Deserialize, Debug)]
pub enum RpcRequest {
    Ping,
    Echo { message: String },
    Add { a: i32, b: i32 },
    GetTime,
    SetValue { key: String, value: String },
    GetValue { key: String },
}

#[derive(Serialize, Deserialize, Debug)]
pub enum RpcResponse {
    Pong,
    Echo { message: String },
    Sum { result: i32 },
    Time { timestamp: u64 },
    ValueSet { key: String },
    Value { key: String, value: Option<String> },
    Error { message: String },
}

type DataStore = Arc<Map<String, String>>;

fn handle_request(store: &DataStore, request: RpcRequest) -> RpcResponse {
    match request {
        RpcRequest::Ping => RpcResponse::Pong,
        RpcRequest::Echo { message } => RpcResponse::Echo { message },
        RpcRequest::Add { a, b } => RpcResponse::Sum { result: a + b },
        RpcRequest::GetTime => RpcResponse::Time {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        },
        RpcRequest::SetValue { key, value } => {
            store.insert(key.clone(), value);
            RpcResponse::ValueSet { key }
        }
        RpcRequest::GetValue { key } => {
            let value = store.get(&key).map(|entry| entry.1.clone());
            RpcResponse::Value { key, value }
        }
    }
}

fn main() -> sluice::Result<()> {
    let reactor = Reactor::new()?;

    let config = TcpServerConfig::builder()
        .name("jsonrpc")
        .address("127.0.0.1:9090".parse()?)
        .worker_count(2)
        .build();
    let server = TcpServer::new(&reactor, config)?;

    let store: DataStore = Arc::new(Map::new());
    server.set_message_callback(move |conn, buf, _at| {
        // One request per line; partial lines stay buffered for next time.
        while let Some(eol) = buf.find_eol() {
            let line = buf.retrieve_as_string(eol + 1);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<RpcRequest>(line) {
                Ok(request) => handle_request(&store, request),
                Err(e) => RpcResponse::Error {
                    message: format!("bad request: {e}"),
                },
            };
            let mut reply = serde_json::to_string(&response).unwrap();
            reply.push('\n');
            conn.send(reply.as_bytes());
        }
    });

    server.start();
    println!("JSON-RPC server listening on {}", server.listen_addr());
    reactor.run();
    Ok(())
}
