//! Player discovery and the device registry.
//!
//! Discovery sends one multicast search request and drains unicast replies
//! for a caller-bounded window, recording one [`DeviceRecord`] per source
//! address. Descriptor metadata (room name, display name, serial) is filled
//! in by a deferred enrichment pass after the window closes; fetching during
//! the receive loop interferes with reply reception, so the ordering is a
//! hard invariant, not an optimization.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::Result;

/// Standard SSDP multicast group and port.
pub const SSDP_MULTICAST_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 255, 255, 250)), 1900);

/// Maximum number of devices the registry records; later discoveries are
/// dropped with an explicit log line.
pub const MAX_DEVICES: usize = 20;

/// Default length of the discovery receive window.
pub const DEFAULT_DISCOVERY_WINDOW: Duration = Duration::from_millis(5000);

const USER_AGENT: &str = concat!("sonotag/", env!("CARGO_PKG_VERSION"));

const SEARCH_REQUEST: &str = "M-SEARCH * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
MAN: \"SSDP:discover\"\r\n\
MX: 1\r\n\
ST: urn:schemas-upnp-org:device:ZonePlayer:1\r\n\
USER-AGENT: Linux UPnP/2.0 sonotag/0.1\r\n";

const SERIAL_MAX_LEN: usize = 19;
const NAME_MAX_LEN: usize = 254;

/// One discovered playback device.
///
/// Created from a discovery reply with only the address and descriptor
/// location; the remaining fields are blank until enrichment fills them.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub addr: IpAddr,
    pub location: String,
    pub serial: String,
    pub room_name: String,
    pub display_name: String,
}

impl DeviceRecord {
    fn new(addr: IpAddr, location: &str) -> Self {
        Self {
            addr,
            location: location.to_string(),
            serial: String::new(),
            room_name: String::new(),
            display_name: String::new(),
        }
    }
}

/// Registry of discovered devices plus the currently active one.
pub struct Registry {
    devices: Vec<DeviceRecord>,
    active: Option<usize>,
    http: Client,
    search_target: SocketAddr,
}

impl Registry {
    pub fn new() -> Result<Self> {
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            devices: Vec::new(),
            active: None,
            http,
            search_target: SSDP_MULTICAST_ADDR,
        })
    }

    /// Redirect the search request, e.g. at a loopback responder in tests.
    pub fn set_search_target(&mut self, target: SocketAddr) {
        self.search_target = target;
    }

    /// Send one search request and record responders until `window` elapses,
    /// then enrich blank records. Returns the number of new devices.
    ///
    /// Zero responses is a normal outcome, not an error. The window is a
    /// hard upper bound regardless of how many responses arrive.
    pub async fn discover(&mut self, window: Duration) -> Result<usize> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;

        debug!(target = %self.search_target, "sending search multicast");
        socket
            .send_to(SEARCH_REQUEST.as_bytes(), self.search_target)
            .await?;

        let deadline = Instant::now() + window;
        let mut new_devices = 0;
        let mut buf = [0u8; 1024];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, peer))) => {
                    debug!(len, peer = %peer, "received discovery response");
                    let datagram = String::from_utf8_lossy(&buf[..len]);
                    for location in scan_locations(&datagram) {
                        if self.add_device(peer.ip(), location) {
                            new_devices += 1;
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "discovery receive failed");
                    break;
                }
                Err(_) => break,
            }
        }

        // Deferred on purpose: fetching descriptors while replies are still
        // arriving loses responses on the single receive socket.
        self.fill_blank_details().await;

        info!(new_devices, total = self.devices.len(), "discovery completed");

        if self.active.is_none() && new_devices > 0 {
            info!(serial = %self.devices[0].serial, "no active device, using first discovered");
            self.active = Some(0);
        }

        Ok(new_devices)
    }

    /// Record a device by source address, rejecting duplicates.
    ///
    /// Returns whether a new record was appended.
    pub fn add_device(&mut self, addr: IpAddr, location: &str) -> bool {
        if self.devices.iter().any(|d| d.addr == addr) {
            return false;
        }
        if self.devices.len() >= MAX_DEVICES {
            warn!(%addr, "registry full, dropping discovered device");
            return false;
        }

        debug!(%addr, location, "recording device");
        self.devices.push(DeviceRecord::new(addr, location));
        true
    }

    /// Fetch descriptor metadata for every record whose serial is still
    /// blank. Fetch failures leave the record usable but unnamed.
    pub async fn fill_blank_details(&mut self) {
        let http = self.http.clone();
        for record in &mut self.devices {
            if record.serial.is_empty() {
                fetch_details(&http, record).await;
                debug!(addr = %record.addr, serial = %record.serial, "filled device details");
            }
        }
    }

    /// Make the device with the given serial the target of control actions.
    ///
    /// An unknown serial leaves the active device unchanged and returns
    /// `false`; this is a normal outcome.
    pub fn select_active(&mut self, serial: &str) -> bool {
        match self.devices.iter().position(|d| d.serial == serial) {
            Some(index) => {
                let device = &self.devices[index];
                info!(serial = %device.serial, room = %device.room_name, "selected active device");
                self.active = Some(index);
                true
            }
            None => {
                info!(serial, "could not find device");
                false
            }
        }
    }

    /// The device control actions currently target, if any.
    pub fn active(&self) -> Option<&DeviceRecord> {
        self.active.map(|i| &self.devices[i])
    }

    /// All discovered devices, in discovery order.
    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }
}

/// Descriptor URIs from `LOCATION:` lines of a discovery response; the URI
/// is whatever follows the 10th character of the line.
fn scan_locations(datagram: &str) -> Vec<&str> {
    datagram
        .lines()
        .map(str::trim_end)
        .filter(|line| line.starts_with("LOCATION:") && line.len() > 10)
        .map(|line| &line[10..])
        .collect()
}

/// Fill a record's fields from its descriptor document.
async fn fetch_details(http: &Client, record: &mut DeviceRecord) {
    let response = match http.get(&record.location).send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(location = %record.location, error = %e, "descriptor fetch failed");
            return;
        }
    };

    match response.text().await {
        Ok(body) => {
            record.room_name = clamp_chars(extract_between(&body, "<roomName>", "</roomName>"), NAME_MAX_LEN);
            record.display_name =
                clamp_chars(extract_between(&body, "<displayName>", "</displayName>"), NAME_MAX_LEN);
            record.serial =
                clamp_chars(extract_between(&body, "<serialNum>", "</serialNum>"), SERIAL_MAX_LEN);
        }
        Err(e) => {
            debug!(location = %record.location, error = %e, "descriptor body read failed");
        }
    }
}

/// Text between the first occurrence of `start_tag` and the next `end_tag`.
///
/// Missing markers yield an empty string; the descriptor wire format is not
/// treated as validated XML.
fn extract_between<'a>(text: &'a str, start_tag: &str, end_tag: &str) -> &'a str {
    let Some(start) = text.find(start_tag) else {
        return "";
    };
    let value_start = start + start_tag.len();
    let Some(len) = text[value_start..].find(end_tag) else {
        return "";
    };
    &text[value_start..value_start + len]
}

fn clamp_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((index, _)) => text[..index].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 50));

    #[test]
    fn add_device_rejects_duplicate_address() {
        let mut registry = Registry::new().unwrap();
        assert!(registry.add_device(LOCAL, "http://192.168.1.50:1400/xml"));
        assert!(!registry.add_device(LOCAL, "http://192.168.1.50:1400/other"));
        assert_eq!(registry.devices().len(), 1);
    }

    #[test]
    fn registry_full_drops_further_devices() {
        let mut registry = Registry::new().unwrap();
        for i in 0..MAX_DEVICES {
            let addr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, i as u8));
            assert!(registry.add_device(addr, "http://example/xml"));
        }
        let extra = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 1, 1));
        assert!(!registry.add_device(extra, "http://example/xml"));
        assert_eq!(registry.devices().len(), MAX_DEVICES);
    }

    #[test]
    fn select_active_with_unknown_serial_leaves_active_unchanged() {
        let mut registry = Registry::new().unwrap();
        registry.add_device(LOCAL, "http://x");
        registry.devices[0].serial = "000E58AABBCC".to_string();
        registry.active = Some(0);

        assert!(!registry.select_active("MISSING"));
        assert_eq!(registry.active().unwrap().serial, "000E58AABBCC");

        assert!(registry.select_active("000E58AABBCC"));
        assert_eq!(registry.active().unwrap().addr, LOCAL);
    }

    #[test]
    fn scan_locations_takes_remainder_from_tenth_character() {
        let datagram = "HTTP/1.1 200 OK\r\n\
CACHE-CONTROL: max-age = 1800\r\n\
LOCATION: http://192.168.1.50:1400/xml/device_description.xml\r\n\
ST: urn:schemas-upnp-org:device:ZonePlayer:1\r\n";
        assert_eq!(
            scan_locations(datagram),
            vec!["http://192.168.1.50:1400/xml/device_description.xml"]
        );
    }

    #[test]
    fn scan_locations_is_case_sensitive_and_tolerates_absence() {
        assert!(scan_locations("Location: http://x\r\n").is_empty());
        assert!(scan_locations("NOTHING HERE\r\n").is_empty());
    }

    #[test]
    fn extract_between_handles_missing_markers() {
        let body = "<root><roomName>Kitchen</roomName></root>";
        assert_eq!(extract_between(body, "<roomName>", "</roomName>"), "Kitchen");
        assert_eq!(extract_between(body, "<displayName>", "</displayName>"), "");
        assert_eq!(extract_between(body, "<roomName>", "</missing>"), "");
    }

    #[test]
    fn clamp_chars_bounds_field_length() {
        assert_eq!(clamp_chars("short", 19), "short");
        let long = "x".repeat(40);
        assert_eq!(clamp_chars(&long, 19).len(), 19);
    }

    #[tokio::test]
    async fn enrichment_skips_records_with_serial_already_set() {
        let mut registry = Registry::new().unwrap();
        // An unreachable location would fail any fetch; a populated serial
        // means no fetch is attempted at all.
        registry.add_device(LOCAL, "http://127.0.0.1:1/unreachable");
        registry.devices[0].serial = "RINCON123".to_string();
        registry.devices[0].room_name = "Den".to_string();

        registry.fill_blank_details().await;

        assert_eq!(registry.devices()[0].serial, "RINCON123");
        assert_eq!(registry.devices()[0].room_name, "Den");
    }

    #[tokio::test]
    async fn zero_window_sends_one_request_and_returns_no_devices() {
        let responder = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let target = responder.local_addr().unwrap();

        let mut registry = Registry::new().unwrap();
        registry.set_search_target(target);

        let found = registry.discover(Duration::ZERO).await.unwrap();
        assert_eq!(found, 0);

        // Exactly one search request reached the target.
        let mut buf = [0u8; 1024];
        let (len, _) = responder.recv_from(&mut buf).await.unwrap();
        let request = std::str::from_utf8(&buf[..len]).unwrap();
        assert!(request.starts_with("M-SEARCH * HTTP/1.1"));
        assert!(request.contains("ST: urn:schemas-upnp-org:device:ZonePlayer:1"));
    }
}
