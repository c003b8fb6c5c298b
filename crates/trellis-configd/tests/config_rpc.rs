use std::{
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use trellis_bus::{BusServer, SubscriptionClient, api::config as cfg};
use trellis_configd::{ConfigStore, INTERFACE, methods};
use trellis_object::{Fault, Object};

#[test]
fn config_rpc_surface() {
    let dir = tempfile::tempdir().unwrap();
    // Safety: set before any thread reads it; only test in this binary.
    unsafe { std::env::set_var("TRELLIS_SOCKET_DIR", dir.path()) };

    let store = Arc::new(ConfigStore::default());
    let server = BusServer::new(methods(store));
    thread::spawn(move || server.listen(INTERFACE).unwrap());

    let socket = trellis_bus::interface_socket_path(INTERFACE).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !socket.exists() {
        assert!(Instant::now() < deadline, "configd did not come up");
        thread::sleep(Duration::from_millis(5));
    }

    // Notify round-trip: fire-and-forget write, value readable afterwards.
    cfg::write_notify(&[b"system", b"thingName"], Object::str("thing-1"), None).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let value = loop {
        match cfg::read(&[b"system", b"thingName"]) {
            Ok(value) => break value,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Err(err) => panic!("config read never succeeded: {err}"),
        }
    };
    assert_eq!(value, Object::str("thing-1"));

    // Map merge, list, and delete.
    cfg::write(
        &[b"services", b"com.acme.Widget"],
        trellis_object::obj_map! { b"version" => Object::str("1.0.0") },
        None,
    )
    .unwrap();
    assert_eq!(cfg::list(&[b"services"]).unwrap(), vec![b"com.acme.Widget".to_vec()]);

    cfg::delete(&[b"services", b"com.acme.Widget"]).unwrap();
    let missing = cfg::read(&[b"services", b"com.acme.Widget"]).unwrap_err();
    assert_eq!(missing.remote(), Some(Fault::NoEntry));

    // Subscribe: a write below the key produces an event carrying the
    // written key path.
    let subs = SubscriptionClient::start();
    let (event_tx, event_rx) = mpsc::channel();
    let handle = cfg::subscribe(
        &[b"system"],
        Box::new(move |_handle: trellis_pool::Handle, data: &trellis_object::Object<'_>| {
            let path: Vec<Vec<u8>> = data
                .as_list()
                .unwrap()
                .iter()
                .map(|segment| segment.as_bytes().unwrap().to_vec())
                .collect();
            event_tx.send(path).unwrap();
            Ok(())
        }),
        None,
    )
    .unwrap();

    cfg::write(&[b"system", b"rootPath"], Object::str("/run/gg"), None).unwrap();
    let written = event_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(written, vec![b"system".to_vec(), b"rootPath".to_vec()]);

    // Subscribing to a key that does not exist is refused.
    let refused = cfg::subscribe(&[b"no-such-key"], Box::new(|_, _| Ok(())), None);
    assert_eq!(refused.unwrap_err().remote(), Some(Fault::NoEntry));

    subs.close(handle);
}
