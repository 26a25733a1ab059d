//! Client side of the `org.freedesktop.portal.ScreenCast` and
//! `org.freedesktop.portal.Screenshot` interfaces.
//!
//! Every portal method that takes a `handle_token` answers through a
//! `org.freedesktop.portal.Request::Response(u status, a{sv} results)` signal on a
//! request object. The signal is subscribed before the method is called so a
//! fast reply cannot be missed.
//!
//! [ScreenCast]: https://flatpak.github.io/xdg-desktop-portal/docs/doc-org.freedesktop.portal.ScreenCast.html
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::StreamExt;
use log::{debug, warn};
use zbus::proxy::SignalStream;
use zbus::zvariant::{self, ObjectPath, OwnedObjectPath, OwnedValue, Value};
use zbus::{Connection, Proxy};

use crate::capture::error::{CaptureError, Result};
use crate::capture::session::{SessionContext, SessionState, Step};

const PORTAL_DEST: &str = "org.freedesktop.portal.Desktop";
const PORTAL_PATH: &str = "/org/freedesktop/portal/desktop";
const SCREENCAST_IFACE: &str = "org.freedesktop.portal.ScreenCast";
const SCREENSHOT_IFACE: &str = "org.freedesktop.portal.Screenshot";
const REQUEST_IFACE: &str = "org.freedesktop.portal.Request";
const SESSION_IFACE: &str = "org.freedesktop.portal.Session";

pub const RESPONSE_SUCCESS: u32 = 0;

static TOKEN_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A value inside a portal result map, detached from the D-Bus wire types.
#[derive(Clone, Debug, PartialEq)]
pub enum PortalValue {
    Bool(bool),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    Str(String),
    List(Vec<PortalValue>),
    Map(Results),
    Other,
}

pub type Results = HashMap<String, PortalValue>;

impl PortalValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PortalValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            PortalValue::U32(n) => Some(n),
            PortalValue::I32(n) => u32::try_from(n).ok(),
            PortalValue::U64(n) => u32::try_from(n).ok(),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            PortalValue::I32(n) => Some(n),
            PortalValue::U32(n) => i32::try_from(n).ok(),
            PortalValue::I64(n) => i32::try_from(n).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[PortalValue]> {
        match self {
            PortalValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Results> {
        match self {
            PortalValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// `(ii)` structures such as a stream's `position` or `size`.
    pub fn as_pair(&self) -> Option<(i32, i32)> {
        match self.as_list()? {
            [a, b] => Some((a.as_i32()?, b.as_i32()?)),
            _ => None,
        }
    }
}

impl From<&Value<'_>> for PortalValue {
    fn from(value: &Value<'_>) -> Self {
        match value {
            Value::Bool(b) => PortalValue::Bool(*b),
            Value::U8(n) => PortalValue::U32(u32::from(*n)),
            Value::U16(n) => PortalValue::U32(u32::from(*n)),
            Value::I16(n) => PortalValue::I32(i32::from(*n)),
            Value::U32(n) => PortalValue::U32(*n),
            Value::I32(n) => PortalValue::I32(*n),
            Value::U64(n) => PortalValue::U64(*n),
            Value::I64(n) => PortalValue::I64(*n),
            Value::Str(s) => PortalValue::Str(s.to_string()),
            Value::ObjectPath(p) => PortalValue::Str(p.to_string()),
            Value::Value(inner) => PortalValue::from(&**inner),
            Value::Array(array) => PortalValue::List(array.iter().map(PortalValue::from).collect()),
            Value::Structure(fields) => {
                PortalValue::List(fields.fields().iter().map(PortalValue::from).collect())
            }
            Value::Dict(dict) => PortalValue::Map(
                dict.iter()
                    .filter_map(|(key, value)| match key {
                        Value::Str(key) => Some((key.to_string(), PortalValue::from(value))),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => PortalValue::Other,
        }
    }
}

/// Request options; the transport adds its own tokens.
#[derive(Clone, Debug, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    U32(u32),
    Str(String),
}

pub type Options = BTreeMap<&'static str, OptionValue>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PortalResponse {
    pub status: u32,
    pub results: Results,
}

impl PortalResponse {
    pub fn success(results: Results) -> Self {
        Self {
            status: RESPONSE_SUCCESS,
            results,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RESPONSE_SUCCESS
    }
}

/// The capture service as seen by the session state machine.
pub trait CaptureService: Send + Sync {
    /// Issues one handshake step and waits for its response.
    fn request(
        &mut self,
        step: Step,
        context: &SessionContext,
        options: Options,
    ) -> impl Future<Output = Result<PortalResponse>> + Send;

    /// Opens the remote that carries the negotiated stream.
    fn open_remote(
        &mut self,
        context: &SessionContext,
    ) -> impl Future<Output = Result<OwnedFd>> + Send;

    fn close_session(&mut self, session_handle: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Session bus connection shared by both portal interfaces.
struct PortalBus {
    connection: Connection,
    sender: String,
}

impl PortalBus {
    async fn connect() -> Result<Self> {
        let connection = Connection::session()
            .await
            .map_err(|err| CaptureError::Unavailable(format!("D-Bus session bus ({err})")))?;
        let sender = connection
            .unique_name()
            .map(|name| name.as_str().trim_start_matches(':').replace('.', "_"))
            .unwrap_or_default();

        Ok(Self { connection, sender })
    }

    async fn proxy(&self, interface: &'static str) -> Result<Proxy<'static>> {
        Ok(Proxy::new(&self.connection, PORTAL_DEST, PORTAL_PATH, interface).await?)
    }

    /// Subscribes to the Response signal of the request that `token` will create.
    async fn subscribe(&self, token: &str) -> Result<(String, SignalStream<'static>)> {
        let path = format!("{PORTAL_PATH}/request/{}/{token}", self.sender);
        let stream = self.response_stream(path.clone()).await?;
        Ok((path, stream))
    }

    async fn response_stream(&self, path: String) -> Result<SignalStream<'static>> {
        let request = Proxy::new(&self.connection, PORTAL_DEST, path, REQUEST_IFACE).await?;
        Ok(request.receive_signal("Response").await?)
    }

    /// Waits for the Response matching `handle`. Old portal versions may hand
    /// back a different request path than the one derived from the token.
    async fn await_response(
        &self,
        expected: &str,
        handle: OwnedObjectPath,
        mut stream: SignalStream<'static>,
    ) -> Result<PortalResponse> {
        if handle.as_str() != expected {
            debug!("portal returned unexpected request path {}", handle.as_str());
            stream = self.response_stream(handle.to_string()).await?;
        }

        let message = stream.next().await.ok_or_else(|| CaptureError::Subprocess {
            tool: "xdg-desktop-portal".to_string(),
            message: "request object vanished before responding".to_string(),
        })?;

        let body = message.body();
        let (status, results): (u32, HashMap<String, OwnedValue>) = body.deserialize()?;
        let results = results
            .iter()
            .map(|(key, value)| (key.clone(), PortalValue::from(&**value)))
            .collect();

        Ok(PortalResponse { status, results })
    }
}

fn next_token() -> String {
    let n = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("simpleshot_{}_{n}", std::process::id())
}

fn wire_options(options: &Options) -> HashMap<&str, Value<'_>> {
    options
        .iter()
        .map(|(key, value)| {
            let value = match value {
                OptionValue::Bool(b) => Value::from(*b),
                OptionValue::U32(n) => Value::from(*n),
                OptionValue::Str(s) => Value::from(s.as_str()),
            };
            (*key, value)
        })
        .collect()
}

fn session_path<'a>(step: Step, context: &'a SessionContext) -> Result<ObjectPath<'a>> {
    let handle = context
        .session_handle
        .as_deref()
        .ok_or(CaptureError::MissingField {
            step,
            field: "session_handle",
        })?;
    ObjectPath::try_from(handle).map_err(|err| CaptureError::Dbus(zbus::Error::from(err)))
}

/// ScreenCast portal over the session bus.
pub struct DbusPortal {
    bus: PortalBus,
    screencast: Proxy<'static>,
}

impl DbusPortal {
    /// Connects and checks that a ScreenCast backend is actually running.
    pub async fn connect() -> Result<Self> {
        let bus = PortalBus::connect().await?;
        let screencast = bus.proxy(SCREENCAST_IFACE).await?;

        let source_types = screencast
            .get_property::<u32>("AvailableSourceTypes")
            .await
            .map_err(|err| CaptureError::Unavailable(format!("ScreenCast portal ({err})")))?;
        debug!("ScreenCast portal available, source types {source_types:#b}");

        Ok(Self { bus, screencast })
    }
}

impl CaptureService for DbusPortal {
    async fn request(
        &mut self,
        step: Step,
        context: &SessionContext,
        mut options: Options,
    ) -> Result<PortalResponse> {
        let token = next_token();
        options.insert("handle_token", OptionValue::Str(token.clone()));
        let (expected, stream) = self.bus.subscribe(&token).await?;

        let handle: OwnedObjectPath = match step {
            Step::CreateSession => {
                options.insert("session_handle_token", OptionValue::Str(next_token()));
                self.screencast
                    .call(step.method(), &(wire_options(&options),))
                    .await?
            }
            Step::SelectSources => {
                let session = session_path(step, context)?;
                self.screencast
                    .call(step.method(), &(session, wire_options(&options)))
                    .await?
            }
            Step::Start => {
                let session = session_path(step, context)?;
                self.screencast
                    .call(step.method(), &(session, "", wire_options(&options)))
                    .await?
            }
            Step::OpenRemote => return Err(CaptureError::InvalidState(SessionState::Started)),
        };

        debug!("{step} issued, waiting on {}", handle.as_str());
        self.bus.await_response(&expected, handle, stream).await
    }

    async fn open_remote(&mut self, context: &SessionContext) -> Result<OwnedFd> {
        let session = session_path(Step::OpenRemote, context)?;
        let options: HashMap<&str, Value<'_>> = HashMap::new();
        let fd: zvariant::OwnedFd = self
            .screencast
            .call(Step::OpenRemote.method(), &(session, options))
            .await?;
        Ok(fd.into())
    }

    async fn close_session(&mut self, session_handle: &str) -> Result<()> {
        let session = Proxy::new(
            &self.bus.connection,
            PORTAL_DEST,
            session_handle.to_string(),
            SESSION_IFACE,
        )
        .await?;
        session.call_method("Close", &()).await?;
        Ok(())
    }
}

/// One non-interactive Screenshot portal request. Returns the file the portal
/// wrote; the caller owns and removes it.
pub async fn request_screenshot() -> Result<PathBuf> {
    let bus = PortalBus::connect().await?;
    let screenshot = bus.proxy(SCREENSHOT_IFACE).await?;

    let token = next_token();
    let mut options = Options::new();
    options.insert("handle_token", OptionValue::Str(token.clone()));
    options.insert("interactive", OptionValue::Bool(false));
    options.insert("modal", OptionValue::Bool(true));

    let (expected, stream) = bus.subscribe(&token).await?;
    let handle: OwnedObjectPath = screenshot
        .call("Screenshot", &("", wire_options(&options)))
        .await
        .map_err(|err| match err {
            zbus::Error::MethodError(..) | zbus::Error::FDO(_) => {
                CaptureError::Unavailable(format!("Screenshot portal ({err})"))
            }
            other => CaptureError::Dbus(other),
        })?;

    let response = bus.await_response(&expected, handle, stream).await?;
    if !response.is_success() {
        return Err(CaptureError::Subprocess {
            tool: "Screenshot portal".to_string(),
            message: format!("request ended with status {}", response.status),
        });
    }

    let uri = response
        .results
        .get("uri")
        .and_then(PortalValue::as_str)
        .ok_or_else(|| CaptureError::Subprocess {
            tool: "Screenshot portal".to_string(),
            message: "response carried no uri".to_string(),
        })?;

    match uri.strip_prefix("file://") {
        Some(path) => Ok(PathBuf::from(percent_decode(path))),
        None => {
            warn!("Screenshot portal returned non-file uri {uri}");
            Err(CaptureError::NoOutput(PathBuf::from(uri)))
        }
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && let Some(byte) = input
                .get(i + 1..i + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        {
            out.push(byte);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_entry_converts_from_wire_values() {
        let mut props: HashMap<&str, Value<'_>> = HashMap::new();
        props.insert("position", Value::from((1920i32, 0i32)));
        props.insert("size", Value::from((2560i32, 1440i32)));
        let entry = Value::from((42u32, props));

        let converted = PortalValue::from(&entry);
        let fields = converted.as_list().unwrap();
        assert_eq!(fields[0].as_u32(), Some(42));

        let props = fields[1].as_map().unwrap();
        assert_eq!(props["position"].as_pair(), Some((1920, 0)));
        assert_eq!(props["size"].as_pair(), Some((2560, 1440)));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(next_token(), next_token());
    }

    #[test]
    fn portal_uri_is_percent_decoded() {
        assert_eq!(
            percent_decode("/home/me/Pictures/Screenshot%20from%202024.png"),
            "/home/me/Pictures/Screenshot from 2024.png"
        );
        assert_eq!(percent_decode("/tmp/100%"), "/tmp/100%");
    }
}
