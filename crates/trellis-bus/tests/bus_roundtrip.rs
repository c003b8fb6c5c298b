use std::{
    collections::HashMap,
    sync::{Arc, Mutex, mpsc},
    thread,
    time::{Duration, Instant},
};

use trellis_bus::{BusServer, Method, SubscriptionClient, call, notify};
use trellis_object::{Map, Object};
use trellis_pool::Handle;

fn start_interface(name: &'static str, methods: Vec<Method>) {
    let server = BusServer::new(methods);
    thread::spawn(move || {
        server.listen(name).unwrap();
    });
    let path = trellis_bus::interface_socket_path(name).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !path.exists() {
        assert!(Instant::now() < deadline, "interface {name} did not come up");
        thread::sleep(Duration::from_millis(5));
    }
}

fn params(entries: &[(&'static [u8], Object<'static>)]) -> Map<'static> {
    let mut map = Map::new();
    for (key, value) in entries {
        map.insert(*key, value.clone());
    }
    map
}

#[test]
fn call_notify_subscribe_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    // Safety: set before any thread reads it; this is the only test in
    // the binary.
    unsafe { std::env::set_var("TRELLIS_SOCKET_DIR", dir.path()) };

    // Unary echo plus a tiny keyed store for the notify round-trip.
    let store: Arc<Mutex<HashMap<Vec<u8>, Object<'static>>>> = Arc::default();
    let write_store = Arc::clone(&store);
    let read_store = Arc::clone(&store);

    start_interface(
        "test_store",
        vec![
            Method::unary("echo", |server: &BusServer, request: &Map<'_>, handle: Handle| {
                server.respond(handle, &Object::Map(request.clone()));
                Ok(())
            }),
            Method::unary("write", move |server: &BusServer, request: &Map<'_>, handle: Handle| {
                let key = request.get(b"key").and_then(Object::as_bytes).unwrap().to_vec();
                let value = request.get(b"value").unwrap().clone().into_owned();
                write_store.lock().unwrap().insert(key, value);
                server.respond(handle, &Object::Null);
                Ok(())
            }),
            Method::unary("read", move |server: &BusServer, request: &Map<'_>, handle: Handle| {
                let key = request.get(b"key").and_then(Object::as_bytes).unwrap();
                match read_store.lock().unwrap().get(key) {
                    Some(value) => server.respond(handle, value),
                    None => return Err(trellis_object::Fault::NoEntry),
                }
                Ok(())
            }),
            Method::subscription("ticks", |server: &BusServer, _request: &Map<'_>, handle: Handle| {
                server.sub_accept(handle, None);
                for tick in 0..3 {
                    server.sub_respond(handle, &Object::I64(tick));
                }
                Ok(())
            }),
        ],
    );

    // call: the echo comes back intact.
    let request = params(&[(b"name", Object::str("thing-1"))]);
    let response = call("test_store", "echo", &request).unwrap();
    assert_eq!(response.as_map().unwrap().get(b"name"), Some(&Object::str("thing-1")));

    // notify: fire-and-forget write, then read it back via call.
    let write = params(&[
        (b"key", Object::str("thingName")),
        (b"value", Object::str("thing-1")),
    ]);
    notify("test_store", "write", &write).unwrap();

    let read = params(&[(b"key", Object::str("thingName"))]);
    let deadline = Instant::now() + Duration::from_secs(5);
    let value = loop {
        match call("test_store", "read", &read) {
            Ok(value) => break value,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Err(err) => panic!("read never succeeded: {err}"),
        }
    };
    assert_eq!(value, Object::str("thing-1"));

    // Unknown methods surface the peer's NoEntry.
    let missing = call("test_store", "nope", &Map::new());
    assert_eq!(
        missing.unwrap_err().remote(),
        Some(trellis_object::Fault::NoEntry)
    );

    // subscribe: three events in order, then close fires on_close.
    let subs = SubscriptionClient::start();
    let (event_tx, event_rx) = mpsc::channel();
    let (close_tx, close_rx) = mpsc::channel();

    let handle = subs
        .subscribe(
            "test_store",
            "ticks",
            &Map::new(),
            Box::new(move |_handle: trellis_pool::Handle, data: &Object<'_>| {
                event_tx.send(data.as_i64().unwrap()).unwrap();
                Ok(())
            }),
            Some(Box::new(move |_handle: trellis_pool::Handle| {
                close_tx.send(()).unwrap();
            })),
        )
        .unwrap();

    for expected in 0..3 {
        let tick = event_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(tick, expected);
    }

    subs.close(handle);
    close_rx.recv_timeout(Duration::from_secs(5)).unwrap();
}
