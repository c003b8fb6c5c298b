use std::{sync::Arc, sync::Mutex, thread};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::TryRngCore;
use tracing::{debug, warn};
use trellis_bus::{BusServer, Method};
use trellis_object::{Fault, Object};

/// Raw token size. 12 bytes encode to exactly 16 base64 characters, the
/// wire form carried in `authToken` payloads and `svcuid` headers.
pub const SVCUID_LEN: usize = 12;
pub const SVCUID_STR_LEN: usize = 16;

const MAX_COMPONENTS: usize = 64;
const MAX_COMPONENT_NAME_LEN: usize = 128;

/// Opaque authentication token identifying a registered component.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Svcuid([u8; SVCUID_LEN]);

impl Svcuid {
    /// Parses the 16-character base64 wire form.
    pub fn from_str_form(s: &[u8]) -> Result<Self, Fault> {
        if s.len() != SVCUID_STR_LEN {
            return Err(Fault::Invalid);
        }
        let decoded = BASE64.decode(s).map_err(|_| {
            warn!("svcuid is invalid base64");
            Fault::Invalid
        })?;
        // 16 chars only decode to 12 bytes when none of them are
        // padding; a padded token must not panic the handler.
        let bytes = <[u8; SVCUID_LEN]>::try_from(decoded).map_err(|_| {
            warn!("svcuid decodes to wrong length");
            Fault::Invalid
        })?;
        Ok(Self(bytes))
    }

    pub fn to_str_form(&self) -> String {
        BASE64.encode(self.0)
    }

    fn random() -> Result<Self, Fault> {
        let mut bytes = [0u8; SVCUID_LEN];
        rand::rngs::OsRng.try_fill_bytes(&mut bytes).map_err(|err| {
            warn!(?err, "failed to draw svcuid entropy");
            Fault::Fatal
        })?;
        Ok(Self(bytes))
    }
}

/// Index of a registration in the component registry. Stable for the
/// process lifetime; registrations are never removed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ComponentHandle(u16);

struct Registration {
    name: Vec<u8>,
    svcuid: Svcuid,
}

/// Authenticated local clients, keyed by name for registration and by
/// svcuid for lookup. Linear scans: the component count is small.
#[derive(Default)]
pub struct ComponentRegistry {
    entries: Mutex<Vec<Registration>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`, idempotently: a second registration returns
    /// the existing handle and svcuid.
    pub fn register(&self, name: &[u8]) -> Result<(ComponentHandle, Svcuid), Fault> {
        if name.is_empty() || name.len() > MAX_COMPONENT_NAME_LEN {
            warn!("component name length invalid");
            return Err(Fault::Range);
        }

        let mut entries = self.entries.lock().unwrap();
        if let Some(index) = entries.iter().position(|entry| entry.name == name) {
            debug!("found existing registration for component");
            return Ok((ComponentHandle(index as u16), entries[index].svcuid));
        }

        if entries.len() >= MAX_COMPONENTS {
            warn!("component registry full");
            return Err(Fault::NoMem);
        }

        // 96 random bits never collide in practice; regenerate anyway so
        // the token-uniqueness invariant holds unconditionally.
        let svcuid = loop {
            let candidate = Svcuid::random()?;
            if !entries.iter().any(|entry| entry.svcuid == candidate) {
                break candidate;
            }
        };

        debug!("registering new svcuid for component");
        entries.push(Registration { name: name.to_vec(), svcuid });
        Ok((ComponentHandle((entries.len() - 1) as u16), svcuid))
    }

    /// Resolves a token to its registration.
    pub fn lookup(&self, svcuid: Svcuid) -> Result<ComponentHandle, Fault> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .position(|entry| entry.svcuid == svcuid)
            .map(|index| ComponentHandle(index as u16))
            .ok_or_else(|| {
                warn!("requested svcuid not registered");
                Fault::NoEntry
            })
    }

    pub fn contains(&self, svcuid: Svcuid) -> bool {
        self.lookup(svcuid).is_ok()
    }

    pub fn name_of(&self, handle: ComponentHandle) -> Vec<u8> {
        let entries = self.entries.lock().unwrap();
        entries[handle.0 as usize].name.clone()
    }
}

/// Serves the `ipc_component` bus interface so privileged components
/// (the stream manager) can validate tokens received out-of-band.
pub fn serve_verify_interface(
    registry: Arc<ComponentRegistry>,
) -> std::io::Result<thread::JoinHandle<()>> {
    let server = BusServer::new(vec![Method::unary(
        "verify_svcuid",
        move |server: &BusServer, params: &trellis_object::Map<'_>, handle: trellis_pool::Handle| {
        let Some(svcuid) = params.get(b"svcuid").and_then(Object::as_bytes) else {
            warn!("verify_svcuid missing svcuid parameter");
            return Err(Fault::Invalid);
        };
        let valid = Svcuid::from_str_form(svcuid)
            .is_ok_and(|svcuid| registry.contains(svcuid));
        server.respond(handle, &Object::Bool(valid));
        Ok(())
    })]);

    thread::Builder::new().name("ipc-component".into()).spawn(move || {
        if let Err(err) = server.listen("ipc_component") {
            tracing::error!(?err, "ipc_component interface exited");
        }
    })
}
