//! Maintains the set of UPnP devices currently visible on the network: listens to the
//! SSDP client's notification stream, admits devices whose advertised type matches what
//! the caller is watching for, fetches their description document, and times them out if
//! neither a refreshing NOTIFY nor a search response arrives before their advertised
//! `CACHE-CONTROL` expires. Admissions and disappearances are both announced on a
//! broadcast channel a caller can subscribe to, alongside the always-available snapshot
//! through `devices()`.

use std::{sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::{sync::broadcast, time::Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    device_description::DeviceDescription,
    ssdp::{DeviceNotificationInfo, Notification, SsdpClient},
    urn::URN,
    FromXml,
};

const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
/// Used when a NOTIFY carries no explicit `CACHE-CONTROL`, which shouldn't happen on a
/// conforming advertiser but is tolerated rather than treated as a parse failure.
const FALLBACK_EXPIRATION_SECS: u32 = 1800;
/// Lagging subscribers drop the oldest events past this many outstanding; a scanner is a
/// live-state feed, not a durable log, so a slow consumer only misses history, it never
/// blocks discovery of new devices.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ScannedDevice {
    pub udn: Uuid,
    pub device_type: String,
    pub location: String,
    pub friendly_name: String,
    expires_at: Instant,
}

/// A device entering or leaving the scanner's live inventory.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Discovered(ScannedDevice),
    Disappeared { udn: Uuid },
}

/// The device types a scanner admits. A discovered device is kept only if its
/// advertised URN matches one of these by device kind, at this version or newer.
#[derive(Debug, Clone)]
pub struct WatchedTypes(Vec<URN>);

impl WatchedTypes {
    pub fn new(types: Vec<URN>) -> Self {
        Self(types)
    }

    fn admits(&self, advertised: &URN) -> bool {
        self.0.iter().any(|wanted| {
            wanted.urn_type == advertised.urn_type && advertised.version >= wanted.version
        })
    }
}

/// Retrieves a device's description document by its `LOCATION` url. Production code
/// fetches it over HTTP; tests substitute a canned response so the admit-on-`Alive` path
/// can be exercised without a live server answering `GET`.
pub trait DescriptionFetcher: Clone + Send + Sync + 'static {
    fn fetch(&self, location: &str) -> impl std::future::Future<Output = Option<String>> + Send;
}

#[derive(Debug, Clone, Default)]
pub struct HttpDescriptionFetcher {
    client: reqwest::Client,
}

impl DescriptionFetcher for HttpDescriptionFetcher {
    async fn fetch(&self, location: &str) -> Option<String> {
        match self.client.get(location).send().await {
            Ok(response) => response.text().await.ok(),
            Err(err) => {
                tracing::warn!(%location, %err, "failed to fetch device description");
                None
            }
        }
    }
}

/// Tracks discovered devices behind a concurrent map so lookups from request-handling
/// code never contend with the scanner's own notification/expiry processing. Generic
/// over how a description document gets fetched, so tests can swap in a canned fetcher
/// in place of a real HTTP round trip.
#[derive(Clone)]
pub struct DeviceScanner<F: DescriptionFetcher = HttpDescriptionFetcher> {
    devices: Arc<DashMap<Uuid, ScannedDevice>>,
    fetcher: F,
    events: broadcast::Sender<ScanEvent>,
}

impl Default for DeviceScanner<HttpDescriptionFetcher> {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceScanner<HttpDescriptionFetcher> {
    pub fn new() -> Self {
        Self::with_fetcher(HttpDescriptionFetcher::default())
    }
}

impl<F: DescriptionFetcher> DeviceScanner<F> {
    pub fn with_fetcher(fetcher: F) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            devices: Arc::new(DashMap::new()),
            fetcher,
            events,
        }
    }

    /// Subscribes to device discovery/disappearance signals. Events published before
    /// this call is made are not replayed; pair with [`Self::devices`] for a snapshot of
    /// what's already known.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    pub fn device(&self, udn: &Uuid) -> Option<ScannedDevice> {
        self.devices.get(udn).map(|d| d.clone())
    }

    pub fn devices(&self) -> Vec<ScannedDevice> {
        self.devices.iter().map(|d| d.clone()).collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Drives the scanner until `cancellation` fires: forwards the SSDP client's
    /// notification stream into admission handling, and periodically sweeps devices
    /// whose advertised lifetime has elapsed without a refresh.
    pub async fn run(&self, client: &SsdpClient, watched: WatchedTypes, cancellation: CancellationToken) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let listen = async {
            client
                .run(cancellation.clone(), |info, _src| {
                    let _ = tx.send(info);
                })
                .await;
        };

        let process = async {
            let mut sweep = tokio::time::interval(TIMEOUT_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    Some(info) = rx.recv() => self.handle_notification(&watched, info).await,
                    _ = sweep.tick() => self.sweep_timed_out(),
                    else => break,
                }
            }
        };

        tokio::join!(listen, process);
    }

    async fn handle_notification(&self, watched: &WatchedTypes, info: DeviceNotificationInfo) {
        let Ok(advertised) = info.device_type.parse::<URN>() else {
            return;
        };
        if !watched.admits(&advertised) {
            return;
        }

        match info.notification {
            Notification::ByeBye => {
                if self.devices.remove(&info.device_id).is_some() {
                    tracing::info!(udn = %info.device_id, "device announced byebye");
                    let _ = self.events.send(ScanEvent::Disappeared { udn: info.device_id });
                }
            }
            Notification::Alive => self.admit(info).await,
        }
    }

    async fn admit(&self, info: DeviceNotificationInfo) {
        let expires_at =
            Instant::now() + Duration::from_secs(info.expiration_time.unwrap_or(FALLBACK_EXPIRATION_SECS) as u64);
        let Some(location) = info.location else {
            return;
        };

        if let Some(mut existing) = self.devices.get_mut(&info.device_id) {
            existing.expires_at = expires_at;
            if existing.location == location {
                return;
            }
            tracing::debug!(udn = %info.device_id, old = %existing.location, new = %location, "device location changed");
            drop(existing);
        } else if self.devices.contains_key(&info.device_id) {
            return;
        }

        let Some((friendly_name, device_type)) = self.fetch_description(&location).await else {
            return;
        };

        // Closes the race between two notifications for the same not-yet-known device
        // both reaching this point: only the first insert wins, the second just updates
        // the expiry it would have set anyway. Only the winning insert announces
        // Discovered; the location-changed-update arm above never does.
        match self.devices.entry(info.device_id) {
            Entry::Occupied(mut entry) => {
                let device = entry.get_mut();
                device.location = location;
                device.expires_at = expires_at;
                device.friendly_name = friendly_name;
                device.device_type = device_type;
            }
            Entry::Vacant(entry) => {
                tracing::info!(udn = %info.device_id, %friendly_name, "device discovered");
                let discovered = ScannedDevice {
                    udn: info.device_id,
                    device_type,
                    location,
                    friendly_name,
                    expires_at,
                };
                entry.insert(discovered.clone());
                let _ = self.events.send(ScanEvent::Discovered(discovered));
            }
        }
    }

    async fn fetch_description(&self, location: &str) -> Option<(String, String)> {
        let body = self.fetcher.fetch(location).await?;
        let mut reader = quick_xml::Reader::from_str(&body);
        match DeviceDescription::read_xml(&mut reader) {
            Ok(description) => Some((
                description.device.friendly_name.into_owned(),
                description.device.device_type.into_owned(),
            )),
            Err(err) => {
                tracing::warn!(%location, %err, "failed to parse device description");
                None
            }
        }
    }

    fn sweep_timed_out(&self) {
        let now = Instant::now();
        let mut timed_out = Vec::new();
        self.devices.retain(|udn, device| {
            let keep = now < device.expires_at;
            if !keep {
                tracing::info!(%udn, friendly_name = %device.friendly_name, "device timed out");
                timed_out.push(*udn);
            }
            keep
        });
        for udn in timed_out {
            let _ = self.events.send(ScanEvent::Disappeared { udn });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device_description::{DeviceDescription, Service},
        urn::{DeviceType, ServiceType},
    };

    #[derive(Debug, Clone, Default)]
    struct FakeFetcher {
        response: Option<String>,
    }

    impl DescriptionFetcher for FakeFetcher {
        async fn fetch(&self, _location: &str) -> Option<String> {
            self.response.clone()
        }
    }

    fn media_server_description(udn: Uuid, friendly_name: &str) -> String {
        let urn = URN::service(ServiceType::ContentDirectory, 1);
        let description = DeviceDescription::new(
            friendly_name,
            udn,
            "urn:schemas-upnp-org:device:MediaServer:1",
            vec![Service::for_registered(&urn, "ContentDirectory", "content_directory")],
        );
        description.into_xml().unwrap()
    }

    #[test]
    fn watched_types_admit_equal_or_newer_version() {
        let watched = WatchedTypes::new(vec![URN::device(DeviceType::MediaServer, 1)]);
        assert!(watched.admits(&URN::device(DeviceType::MediaServer, 1)));
        assert!(watched.admits(&URN::device(DeviceType::MediaServer, 2)));
        assert!(!watched.admits(&URN::device(DeviceType::MediaRenderer, 1)));
        assert!(!watched.admits(&URN::service(ServiceType::ContentDirectory, 1)));
    }

    #[tokio::test]
    async fn byebye_for_unknown_device_is_a_no_op() {
        let scanner = DeviceScanner::with_fetcher(FakeFetcher::default());
        let watched = WatchedTypes::new(vec![URN::device(DeviceType::MediaServer, 1)]);
        scanner
            .handle_notification(
                &watched,
                DeviceNotificationInfo {
                    device_id: Uuid::new_v4(),
                    device_type: "urn:schemas-upnp-org:device:MediaServer:1".into(),
                    location: None,
                    expiration_time: None,
                    notification: Notification::ByeBye,
                },
            )
            .await;
        assert_eq!(scanner.device_count(), 0);
    }

    #[tokio::test]
    async fn unmatched_device_type_is_ignored() {
        let scanner = DeviceScanner::with_fetcher(FakeFetcher::default());
        let watched = WatchedTypes::new(vec![URN::device(DeviceType::MediaServer, 2)]);
        scanner
            .handle_notification(
                &watched,
                DeviceNotificationInfo {
                    device_id: Uuid::new_v4(),
                    device_type: "urn:schemas-upnp-org:device:MediaServer:1".into(),
                    location: Some("http://127.0.0.1:1/desc.xml".into()),
                    expiration_time: Some(60),
                    notification: Notification::Alive,
                },
            )
            .await;
        assert_eq!(scanner.device_count(), 0);
    }

    #[tokio::test]
    async fn alive_for_watched_type_fetches_and_emits_discovered() {
        let udn = Uuid::new_v4();
        let fetcher = FakeFetcher {
            response: Some(media_server_description(udn, "Living Room Server")),
        };
        let scanner = DeviceScanner::with_fetcher(fetcher);
        let watched = WatchedTypes::new(vec![URN::device(DeviceType::MediaServer, 1)]);
        let mut events = scanner.subscribe();

        scanner
            .handle_notification(
                &watched,
                DeviceNotificationInfo {
                    device_id: udn,
                    device_type: "urn:schemas-upnp-org:device:MediaServer:1".into(),
                    location: Some("http://127.0.0.1:1/desc.xml".into()),
                    expiration_time: Some(60),
                    notification: Notification::Alive,
                },
            )
            .await;

        assert_eq!(scanner.device_count(), 1);
        assert_eq!(scanner.device(&udn).unwrap().friendly_name, "Living Room Server");
        match events.recv().await.unwrap() {
            ScanEvent::Discovered(device) => assert_eq!(device.udn, udn),
            other => panic!("expected Discovered, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_alive_for_same_device_does_not_refire_discovered() {
        let udn = Uuid::new_v4();
        let fetcher = FakeFetcher {
            response: Some(media_server_description(udn, "Living Room Server")),
        };
        let scanner = DeviceScanner::with_fetcher(fetcher);
        let watched = WatchedTypes::new(vec![URN::device(DeviceType::MediaServer, 1)]);
        let mut events = scanner.subscribe();
        let notification = DeviceNotificationInfo {
            device_id: udn,
            device_type: "urn:schemas-upnp-org:device:MediaServer:1".into(),
            location: Some("http://127.0.0.1:1/desc.xml".into()),
            expiration_time: Some(60),
            notification: Notification::Alive,
        };

        scanner.handle_notification(&watched, notification.clone()).await;
        scanner.handle_notification(&watched, notification).await;

        assert_eq!(scanner.device_count(), 1);
        assert!(matches!(events.recv().await.unwrap(), ScanEvent::Discovered(_)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn byebye_after_discovery_emits_disappeared() {
        let udn = Uuid::new_v4();
        let fetcher = FakeFetcher {
            response: Some(media_server_description(udn, "Living Room Server")),
        };
        let scanner = DeviceScanner::with_fetcher(fetcher);
        let watched = WatchedTypes::new(vec![URN::device(DeviceType::MediaServer, 1)]);
        scanner
            .handle_notification(
                &watched,
                DeviceNotificationInfo {
                    device_id: udn,
                    device_type: "urn:schemas-upnp-org:device:MediaServer:1".into(),
                    location: Some("http://127.0.0.1:1/desc.xml".into()),
                    expiration_time: Some(60),
                    notification: Notification::Alive,
                },
            )
            .await;
        let mut events = scanner.subscribe();

        scanner
            .handle_notification(
                &watched,
                DeviceNotificationInfo {
                    device_id: udn,
                    device_type: "urn:schemas-upnp-org:device:MediaServer:1".into(),
                    location: None,
                    expiration_time: None,
                    notification: Notification::ByeBye,
                },
            )
            .await;

        assert_eq!(scanner.device_count(), 0);
        assert!(matches!(
            events.recv().await.unwrap(),
            ScanEvent::Disappeared { udn: disappeared } if disappeared == udn
        ));
    }
}
