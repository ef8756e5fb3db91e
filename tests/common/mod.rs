// MIT License - Copyright (c) 2026 Peter Wright
// LEAP bridge
//
// In-memory controller for integration tests. Every `connect` hands out one
// end of a duplex pipe; the other end is served by a task that answers
// requests through a handler and can push or hang up on command.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

use leap_bridge::transport::{BoxedStream, ConnectFuture, Connector};
use leap_bridge::{LeapConnection, LeapError, SessionOptions};

pub enum Reply {
    Respond(Value),
    After(Duration, Value),
    Ignore,
    Hangup,
}

pub type Handler = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

enum Command {
    Push(Value),
    Hangup,
}

pub struct FakeController {
    name: String,
    handler: Handler,
    refuse: AtomicBool,
    handshake_ms: AtomicU64,
    connects: AtomicUsize,
    log: Arc<Mutex<Vec<Value>>>,
    streams: Mutex<Vec<mpsc::UnboundedSender<Command>>>,
}

impl FakeController {
    pub fn new(name: &str, handler: impl Fn(&Value) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            handler: Arc::new(handler),
            refuse: AtomicBool::new(false),
            handshake_ms: AtomicU64::new(0),
            connects: AtomicUsize::new(0),
            log: Arc::new(Mutex::new(Vec::new())),
            streams: Mutex::new(Vec::new()),
        })
    }

    /// A controller that serves a fixed url -> (body type, body) table.
    pub fn serving(name: &str, table: HashMap<String, (String, Value)>) -> Arc<Self> {
        Self::new(name, move |req| table_reply(&table, req))
    }

    pub fn connection(self: &Arc<Self>, request_timeout: Duration) -> LeapConnection {
        LeapConnection::new(self.clone(), request_timeout)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Delay every connect by `delay` before it succeeds or is refused.
    pub fn slow_handshake(&self, delay: Duration) {
        self.handshake_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Value> {
        self.log.lock().unwrap().clone()
    }

    pub fn requests_to(&self, url: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|r| r["Header"]["Url"] == url)
            .collect()
    }

    /// Tag of the most recent subscription to `url`.
    pub fn subscription_tag(&self, url: &str) -> Option<String> {
        self.requests_to(url)
            .iter()
            .rev()
            .find(|r| r["CommuniqueType"] == "SubscribeRequest")
            .and_then(|r| r["Header"]["ClientTag"].as_str().map(str::to_string))
    }

    /// Write a message on the newest open stream.
    pub fn push(&self, message: Value) {
        if let Some(tx) = self.streams.lock().unwrap().last() {
            let _ = tx.send(Command::Push(message));
        }
    }

    /// Close every open stream.
    pub fn hangup(&self) {
        for tx in self.streams.lock().unwrap().drain(..) {
            let _ = tx.send(Command::Hangup);
        }
    }

    /// Yield until `pred` holds on the request log.
    pub async fn wait_until(&self, pred: impl Fn(&[Value]) -> bool) {
        for _ in 0..1000 {
            if pred(&self.requests()) {
                return;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("{}: condition never held; log: {:?}", self.name, self.requests());
    }
}

impl Connector for FakeController {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let handshake = self.handshake_ms.load(Ordering::SeqCst);
            if handshake > 0 {
                tokio::time::sleep(Duration::from_millis(handshake)).await;
            }
            if self.refuse.load(Ordering::SeqCst) {
                return Err(LeapError::ConnectionError {
                    reason: format!("{} refused the connection", self.name),
                });
            }
            let (client, server) = tokio::io::duplex(64 * 1024);
            let (tx, rx) = mpsc::unbounded_channel();
            self.streams.lock().unwrap().push(tx.clone());
            tokio::spawn(serve(server, self.handler.clone(), self.log.clone(), tx, rx));
            Ok(Box::new(client) as BoxedStream)
        })
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

async fn serve(
    stream: DuplexStream,
    handler: Handler,
    log: Arc<Mutex<Vec<Value>>>,
    tx: mpsc::UnboundedSender<Command>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let (rd, mut wr) = tokio::io::split(stream);
    let mut lines = BufReader::new(rd).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let request: Value = serde_json::from_str(&line).unwrap();
                log.lock().unwrap().push(request.clone());
                match handler(&request) {
                    Reply::Respond(v) => write(&mut wr, &v).await,
                    Reply::After(delay, v) => {
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(Command::Push(v));
                        });
                    }
                    Reply::Ignore => {}
                    Reply::Hangup => break,
                }
            }
            cmd = rx.recv() => match cmd {
                Some(Command::Push(v)) => write(&mut wr, &v).await,
                Some(Command::Hangup) | None => break,
            },
        }
    }
}

async fn write(wr: &mut tokio::io::WriteHalf<DuplexStream>, message: &Value) {
    let mut line = serde_json::to_vec(message).unwrap();
    line.extend_from_slice(b"\r\n");
    let _ = wr.write_all(&line).await;
}

// ---------------------------------------------------------------------------
// Message builders
// ---------------------------------------------------------------------------

fn response_type(request: &Value) -> &'static str {
    match request["CommuniqueType"].as_str() {
        Some("SubscribeRequest") => "SubscribeResponse",
        Some("UpdateRequest") => "UpdateResponse",
        Some("CreateRequest") => "CreateResponse",
        _ => "ReadResponse",
    }
}

/// Answer `request` with a status and optional typed body, echoing its tag.
pub fn answer(request: &Value, status: &str, body: Option<(&str, Value)>) -> Value {
    let mut header = json!({
        "StatusCode": status,
        "Url": request["Header"]["Url"],
        "ClientTag": request["Header"]["ClientTag"],
    });
    let mut message = json!({ "CommuniqueType": response_type(request) });
    if let Some((body_type, body)) = body {
        header["MessageBodyType"] = json!(body_type);
        message["Body"] = body;
    }
    message["Header"] = header;
    message
}

pub fn ok(request: &Value, body_type: &str, body: Value) -> Value {
    answer(request, "200 OK", Some((body_type, body)))
}

/// Serve reads from a table; subscriptions and pings always succeed.
pub fn table_reply(table: &HashMap<String, (String, Value)>, request: &Value) -> Reply {
    let url = request["Header"]["Url"].as_str().unwrap_or_default();
    if request["CommuniqueType"] == "SubscribeRequest" || url == "/server/1/status/ping" {
        return Reply::Respond(answer(request, "200 OK", None));
    }
    match table.get(url) {
        Some((body_type, _)) if body_type == "204" => {
            Reply::Respond(answer(request, "204 No Content", None))
        }
        Some((body_type, body)) => Reply::Respond(ok(request, body_type, body.clone())),
        None => Reply::Respond(answer(
            request,
            "404 Not Found",
            Some(("ExceptionDetail", json!({ "Message": format!("{url} not found") }))),
        )),
    }
}

/// A button press or release push, untagged.
pub fn button_push(button_href: &str, event: &str) -> Value {
    json!({
        "CommuniqueType": "ReadResponse",
        "Header": {
            "StatusCode": "200 OK",
            "Url": format!("{button_href}/status/event"),
            "MessageBodyType": "OneButtonStatusEvent",
        },
        "Body": {
            "ButtonStatus": {
                "Button": { "href": button_href },
                "ButtonEvent": { "EventType": event },
            }
        }
    })
}

pub fn fast_options() -> SessionOptions {
    SessionOptions::builder()
        .request_timeout(Duration::from_secs(2))
        .reconnect_attempts(3)
        .reconnect_delay(Duration::from_millis(100))
        .build()
}

// ---------------------------------------------------------------------------
// Topology fixture
// ---------------------------------------------------------------------------

/// One RadioRA 3 project with a Pico in the Kitchen, an unaddressed keypad
/// beside it, a Hall whose stations cannot be read, and an empty Garage.
pub fn ra3_tree() -> HashMap<String, (String, Value)> {
    let mut t = HashMap::new();
    let mut put = |url: &str, body_type: &str, body: Value| {
        t.insert(url.to_string(), (body_type.to_string(), body));
    };
    put(
        "/project",
        "OneProjectDefinition",
        json!({ "Project": { "Name": "Home", "ProductType": "Lutron RadioRA 3 Project" } }),
    );
    put(
        "/device?where=IsThisDevice:true",
        "OneDeviceDefinition",
        json!({ "Device": {
            "href": "/device/1",
            "Name": "Processor",
            "SerialNumber": 12345678,
            "ModelNumber": "RR-PROC3-KIT",
            "DeviceType": "RadioRa3Processor",
            "FirmwareImage": { "Firmware": { "DisplayName": "22.06.10f000" } }
        }}),
    );
    put(
        "/area",
        "MultipleAreaDefinition",
        json!({ "Areas": [
            { "href": "/area/1", "Name": "Home", "IsLeaf": false },
            { "href": "/area/2", "Name": "Kitchen", "IsLeaf": true, "Parent": { "href": "/area/1" } },
            { "href": "/area/3", "Name": "Hall", "IsLeaf": true, "Parent": { "href": "/area/1" } },
            { "href": "/area/4", "Name": "Garage", "IsLeaf": true, "Parent": { "href": "/area/1" } }
        ]}),
    );
    put(
        "/area/2/associatedcontrolstation",
        "MultipleControlStationDefinition",
        json!({ "ControlStations": [{
            "href": "/controlstation/20",
            "Name": "Island",
            "AssociatedGangedDevices": [
                { "Device": { "href": "/device/10" }, "GangPosition": 0 },
                { "Device": { "href": "/device/11" }, "GangPosition": 1 }
            ]
        }]}),
    );
    put("/area/4/associatedcontrolstation", "204", Value::Null);
    put(
        "/device/10",
        "OneDeviceDefinition",
        json!({ "Device": {
            "href": "/device/10",
            "Name": "Pico",
            "SerialNumber": 87654321,
            "DeviceType": "Pico3ButtonRaiseLower",
            "AddressedState": "Addressed",
            "ButtonGroups": [{ "href": "/buttongroup/100" }]
        }}),
    );
    put(
        "/device/11",
        "OneDeviceDefinition",
        json!({ "Device": {
            "href": "/device/11",
            "Name": "Keypad",
            "DeviceType": "SunnataKeypad",
            "AddressedState": "Unaddressed"
        }}),
    );
    put(
        "/device/10/buttongroup",
        "MultipleButtonGroupDefinition",
        json!({ "ButtonGroups": [{
            "href": "/buttongroup/100",
            "Parent": { "href": "/device/10" },
            "Buttons": [{ "href": "/button/101" }, { "href": "/button/104" }]
        }]}),
    );
    put(
        "/button/101",
        "OneButtonDefinition",
        json!({ "Button": {
            "href": "/button/101",
            "Name": "Button 1",
            "ButtonNumber": 0,
            "Engraving": { "Text": "On" }
        }}),
    );
    put(
        "/button/104",
        "OneButtonDefinition",
        json!({ "Button": { "href": "/button/104", "Name": "Raise", "ButtonNumber": 3 } }),
    );
    t
}
