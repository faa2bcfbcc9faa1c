//! Remote-control actions against a playback device.
//!
//! Actions are single synchronous HTTP POSTs of a fixed XML envelope to the
//! device's control endpoint, identified by a quoted namespaced action
//! header. Success is strictly an HTTP 200; any other status or transport
//! error is reported as `false` with the condition logged. The wire gives
//! no signal to tell device-side rejection from network failure apart.

use std::net::SocketAddr;

use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use crate::Result;
use crate::registry::DeviceRecord;

/// Port every device exposes its control endpoints on.
pub const CONTROL_PORT: u16 = 1400;

/// Sentinel for a service name that matched nothing.
pub const UNRESOLVED_SERVICE_ID: i32 = -1;

const USER_AGENT: &str = concat!("sonotag/", env!("CARGO_PKG_VERSION"));
const CONTENT_TYPE: &str = "text/xml";

const AV_TRANSPORT_ENDPOINT: &str = "/MediaRenderer/AVTransport/Control";
const MUSIC_SERVICES_ENDPOINT: &str = "/MusicServices/Control";

const PLAY_ACTION: &str = "\"urn:schemas-upnp-org:service:AVTransport:1#Play\"";
const PLAY_PAYLOAD: &str = "<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\"><s:Body><u:Play xmlns:u=\"urn:schemas-upnp-org:service:AVTransport:1\"><InstanceID>0</InstanceID><Speed>1</Speed></u:Play></s:Body></s:Envelope>";

const PAUSE_ACTION: &str = "\"urn:schemas-upnp-org:service:AVTransport:1#Pause\"";
const PAUSE_PAYLOAD: &str = "<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\"><s:Body><u:Pause xmlns:u=\"urn:schemas-upnp-org:service:AVTransport:1\"><InstanceID>0</InstanceID></u:Pause></s:Body></s:Envelope>";

const QUEUE_ACTION: &str = "\"urn:schemas-upnp-org:service:AVTransport:1#SetAVTransportURI\"";
const QUEUE_PAYLOAD_PREFIX: &str = "<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\"><s:Body><u:SetAVTransportURI xmlns:u=\"urn:schemas-upnp-org:service:AVTransport:1\"><InstanceID>0</InstanceID><CurrentURI>";
const QUEUE_PAYLOAD_SUFFIX: &str = "</CurrentURI><CurrentURIMetaData></CurrentURIMetaData></u:SetAVTransportURI></s:Body></s:Envelope>";

const LIST_SERVICES_ACTION: &str =
    "\"urn:schemas-upnp-org:service:MusicServices:1#ListAvailableServices\"";
const LIST_SERVICES_PAYLOAD: &str = "<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\"><s:Body><u:ListAvailableServices xmlns:u=\"urn:schemas-upnp-org:service:MusicServices:1\"><InstanceID>0</InstanceID></u:ListAvailableServices></s:Body></s:Envelope>";

/// Client for control actions.
///
/// Every action method takes the target device as `Option<&DeviceRecord>`:
/// `None` (no active device) returns `false` without attempting a request.
pub struct ControlClient {
    http: Client,
    port: u16,
}

impl ControlClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: Client::builder().user_agent(USER_AGENT).build()?,
            port: CONTROL_PORT,
        })
    }

    /// Override the control port, e.g. for a fake device in tests.
    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// Start playback on the device.
    pub async fn play(&self, device: Option<&DeviceRecord>) -> bool {
        let Some(device) = device else {
            warn!("play: no active device");
            return false;
        };
        info!(room = %device.room_name, serial = %device.serial, "playing");
        self.send_action(device, AV_TRANSPORT_ENDPOINT, PLAY_ACTION, PLAY_PAYLOAD.to_string())
            .await
    }

    /// Pause playback on the device.
    pub async fn pause(&self, device: Option<&DeviceRecord>) -> bool {
        let Some(device) = device else {
            warn!("pause: no active device");
            return false;
        };
        info!(room = %device.room_name, serial = %device.serial, "pausing");
        self.send_action(device, AV_TRANSPORT_ENDPOINT, PAUSE_ACTION, PAUSE_PAYLOAD.to_string())
            .await
    }

    /// Stop playback; the devices treat this the same as pause.
    pub async fn stop(&self, device: Option<&DeviceRecord>) -> bool {
        self.pause(device).await
    }

    /// Queue a URI for playback under the given music service.
    pub async fn queue_uri(&self, device: Option<&DeviceRecord>, service_id: i32, uri: &str) -> bool {
        let Some(device) = device else {
            warn!("queue: no active device");
            return false;
        };
        info!(room = %device.room_name, uri, service_id, "queueing track");
        self.send_action(
            device,
            AV_TRANSPORT_ENDPOINT,
            QUEUE_ACTION,
            queue_payload(service_id, uri),
        )
        .await
    }

    /// Resolve a human-readable service name to the device's numeric id by
    /// fuzzy-matching the service listing. Returns
    /// [`UNRESOLVED_SERVICE_ID`] when nothing matches or there is no device.
    pub async fn resolve_service_id(
        &self,
        device: Option<&DeviceRecord>,
        service_name: &str,
    ) -> i32 {
        let Some(device) = device else {
            warn!("service lookup: no active device");
            return UNRESOLVED_SERVICE_ID;
        };

        debug!(service_name, "resolving service id");
        let response = match self
            .post_action(
                device,
                MUSIC_SERVICES_ENDPOINT,
                LIST_SERVICES_ACTION,
                LIST_SERVICES_PAYLOAD.to_string(),
            )
            .await
        {
            Ok(response) if response.status() == StatusCode::OK => response,
            Ok(response) => {
                warn!(status = response.status().as_u16(), "service listing rejected");
                return UNRESOLVED_SERVICE_ID;
            }
            Err(e) => {
                warn!(error = %e, "service listing failed");
                return UNRESOLVED_SERVICE_ID;
            }
        };

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "service listing body read failed");
                return UNRESOLVED_SERVICE_ID;
            }
        };

        let id = scan_service_id(&body, service_name);
        info!(service_name, id, "matched service id");
        id
    }

    /// POST one action envelope and report strict HTTP 200 success.
    async fn send_action(
        &self,
        device: &DeviceRecord,
        endpoint: &str,
        action: &str,
        payload: String,
    ) -> bool {
        match self.post_action(device, endpoint, action, payload).await {
            Ok(response) if response.status() == StatusCode::OK => true,
            Ok(response) => {
                warn!(status = response.status().as_u16(), action, "control action rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, action, "control action failed");
                false
            }
        }
    }

    async fn post_action(
        &self,
        device: &DeviceRecord,
        endpoint: &str,
        action: &str,
        payload: String,
    ) -> reqwest::Result<reqwest::Response> {
        let endpoint_addr = SocketAddr::new(device.addr, self.port);
        let url = format!("http://{endpoint_addr}{endpoint}");
        self.http
            .post(url)
            .header("Content-Type", CONTENT_TYPE)
            .header("SOAPACTION", action)
            .body(payload)
            .send()
            .await
    }
}

fn queue_payload(service_id: i32, uri: &str) -> String {
    format!("{QUEUE_PAYLOAD_PREFIX}{uri}?sid={service_id}{QUEUE_PAYLOAD_SUFFIX}")
}

/// Scan an XML-escaped service listing for `service_name` and pull the
/// numeric id out of the last matching `Service` fragment.
///
/// Matching is a case-insensitive substring test against the whole fragment.
/// A fragment with a missing or non-numeric id marker is skipped; no match
/// at all yields [`UNRESOLVED_SERVICE_ID`].
fn scan_service_id(body: &str, service_name: &str) -> i32 {
    const FRAGMENT_START: &str = "&lt;service ";
    const FRAGMENT_END: &str = "&lt;/service";
    const ID_START: &str = "id=&quot;";
    const ID_END: &str = "&quot;";

    let haystack = body.to_ascii_lowercase();
    let needle = service_name.to_ascii_lowercase();

    let mut service_id = UNRESOLVED_SERVICE_ID;
    let mut pos = 0;

    while let Some(found) = haystack[pos..].find(FRAGMENT_START) {
        let fragment_start = pos + found + FRAGMENT_START.len();
        let Some(fragment_len) = haystack[fragment_start..].find(FRAGMENT_END) else {
            break;
        };
        let fragment = &haystack[fragment_start..fragment_start + fragment_len];

        if fragment.contains(&needle)
            && let Some(id_pos) = fragment.find(ID_START)
        {
            let digits_start = id_pos + ID_START.len();
            if let Some(id_len) = fragment[digits_start..].find(ID_END)
                && let Ok(id) = fragment[digits_start..digits_start + id_len].parse::<i32>()
            {
                service_id = id;
            }
        }

        pos = fragment_start + fragment_len;
    }

    service_id
}
