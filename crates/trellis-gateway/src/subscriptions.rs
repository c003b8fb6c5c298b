use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use trellis_bus::{CallError, SubscriptionClient};
use trellis_object::{Fault, Map, Object};
use trellis_pool::Handle;

use crate::server::Gateway;

/// Tracked gateway-initiated bus subscriptions.
const MAX_BRIDGED_SUBSCRIPTIONS: usize = 50;

/// Formats one bus event as a modeled event frame and writes it to the
/// originating gateway stream.
pub type EventFormatter = fn(&Arc<Gateway>, &Object<'_>, Handle, i32) -> Result<(), Fault>;

/// `resp_handle` is nonzero iff the slot is occupied.
#[derive(Default, Copy, Clone)]
struct Slot {
    resp_handle: u32,
    stream_id: i32,
    recv_handle: u32,
}

/// Binds gateway streams to bus subscriptions.
///
/// Each slot records the originating connection handle and stream id
/// plus the bus-side receive handle, so connection teardown can find
/// and close every subscription the connection owns. The slot mutex is
/// a leaf lock: nothing is called while holding it.
pub struct SubscriptionBridge {
    slots: Mutex<[Slot; MAX_BRIDGED_SUBSCRIPTIONS]>,
}

impl Default for SubscriptionBridge {
    fn default() -> Self {
        Self { slots: Mutex::new([Slot::default(); MAX_BRIDGED_SUBSCRIPTIONS]) }
    }
}

impl SubscriptionBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&self, resp_handle: Handle, stream_id: i32) -> Result<usize, Fault> {
        let mut slots = self.slots.lock().unwrap();
        let Some(index) = slots.iter().position(|slot| slot.resp_handle == 0) else {
            warn!("exceeded maximum tracked subscriptions");
            return Err(Fault::NoMem);
        };
        slots[index] =
            Slot { resp_handle: resp_handle.raw(), stream_id, recv_handle: 0 };
        Ok(index)
    }

    fn release(&self, index: usize, resp_handle: Handle) {
        let mut slots = self.slots.lock().unwrap();
        if slots[index].resp_handle == resp_handle.raw() {
            slots[index] = Slot::default();
        } else {
            debug!("subscription slot already released");
        }
    }

    fn set_recv(&self, index: usize, resp_handle: Handle, recv_handle: Handle) -> Result<(), Fault> {
        let mut slots = self.slots.lock().unwrap();
        if slots[index].resp_handle != resp_handle.raw() {
            debug!("subscription slot released during bind");
            return Err(Fault::Failure);
        }
        slots[index].recv_handle = recv_handle.raw();
        Ok(())
    }

    /// The stream an event belongs to, if the slot is still bound to
    /// `resp_handle`.
    fn stream_of(&self, index: usize, resp_handle: Handle) -> Option<i32> {
        let slots = self.slots.lock().unwrap();
        (slots[index].resp_handle == resp_handle.raw()).then(|| slots[index].stream_id)
    }

    fn take_matching(&self, resp_handle: Handle, stream_id: Option<i32>) -> Vec<Handle> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .filter(|slot| {
                slot.resp_handle == resp_handle.raw()
                    && slot.recv_handle != 0
                    && stream_id.is_none_or(|id| slot.stream_id == id)
            })
            .map(|slot| Handle::from_raw(slot.recv_handle))
            .collect()
    }

    /// Closes every bus subscription owned by a dying connection. Runs
    /// from the gateway pool's release callback.
    pub fn release_conn(&self, resp_handle: Handle) {
        self.close_recv_handles(self.take_matching(resp_handle, None));
    }

    /// Closes the bus subscriptions bound to one stream, for inbound
    /// terminate-stream frames.
    pub fn release_stream(&self, resp_handle: Handle, stream_id: i32) {
        self.close_recv_handles(self.take_matching(resp_handle, Some(stream_id)));
    }

    fn close_recv_handles(&self, recv_handles: Vec<Handle>) {
        let Ok(subs) = SubscriptionClient::get() else {
            return;
        };
        for recv_handle in recv_handles {
            // Close fires the subscription's on_close, which clears the
            // bridge slot.
            subs.close(recv_handle);
        }
    }
}

/// Claims a bridge slot and opens the bus subscription backing a
/// gateway stream. Events are formatted by `formatter` on the
/// subscription thread; a formatter error closes the bus subscription.
pub fn bind_subscription(
    gateway: &Arc<Gateway>,
    resp_handle: Handle,
    stream_id: i32,
    interface: &str,
    method: &str,
    params: &Map<'_>,
    formatter: EventFormatter,
) -> Result<(), CallError> {
    let subs = SubscriptionClient::get().map_err(CallError::Local)?;
    let bridge = Arc::clone(&gateway.bridge);
    let index = bridge.claim(resp_handle, stream_id).map_err(CallError::Local)?;

    let event_gateway = Arc::clone(gateway);
    let event_bridge = Arc::clone(&gateway.bridge);
    let on_response = Box::new(move |_recv: Handle, data: &Object<'_>| {
        let Some(stream_id) = event_bridge.stream_of(index, resp_handle) else {
            debug!("event on released subscription");
            return Err(Fault::Failure);
        };
        formatter(&event_gateway, data, resp_handle, stream_id)
    });

    let close_bridge = Arc::clone(&gateway.bridge);
    let on_close = Box::new(move |_recv: Handle| {
        close_bridge.release(index, resp_handle);
    });

    let recv_handle = match subs.subscribe(interface, method, params, on_response, Some(on_close)) {
        Ok(recv_handle) => recv_handle,
        Err(err) => {
            bridge.release(index, resp_handle);
            return Err(err);
        }
    };

    if bridge.set_recv(index, resp_handle, recv_handle).is_err() {
        // The connection died while the subscription was being set up.
        subs.close(recv_handle);
        return Err(CallError::Local(Fault::NotConnected));
    }
    Ok(())
}
