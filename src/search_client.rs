//! One-shot SSDP search for services of a particular type, resolving each responding
//! device's description and service SCPD into a ready-to-use [`ScpdClient`].

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    device_description::DeviceDescription,
    service_client::{ScpdClient, ScpdService},
    ssdp::{DeviceNotificationInfo, SsdpClient},
    FromXml,
};

#[derive(Debug, Clone)]
pub struct SearchOptions {
    timeout: Duration,
    take: Option<usize>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchOptions {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            take: Some(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn take(mut self, take: Option<usize>) -> Self {
        self.take = take;
        self
    }
}

#[derive(Debug)]
pub struct SearchClient {
    ssdp: SsdpClient,
    fetch_client: reqwest::Client,
}

impl SearchClient {
    pub async fn bind() -> anyhow::Result<Self> {
        let ssdp = SsdpClient::bind().await?;
        Ok(Self {
            ssdp,
            fetch_client: reqwest::Client::new(),
        })
    }

    async fn build_scpd_client<T: ScpdService>(
        target_urn: Arc<String>,
        location: String,
        fetch_client: reqwest::Client,
    ) -> anyhow::Result<ScpdClient<T>> {
        let device_description_xml = fetch_client
            .get(&location)
            .send()
            .await?
            .text()
            .await
            .context("read device description body")?;
        let device_description =
            DeviceDescription::read_xml(&mut quick_xml::Reader::from_str(&device_description_xml))?;
        let service = device_description
            .device
            .all_services()
            .find(|s| s.service_type == *target_urn)
            .context("service not advertised by responding device")?;

        let mut url = reqwest::Url::parse(&location)?;
        url.set_path(&service.control_url);
        let control_url = url.to_string();
        url.set_path(&service.scpd_url);
        let scpd_xml = fetch_client
            .get(url)
            .send()
            .await?
            .text()
            .await
            .context("read scpd body")?;

        ScpdClient::new(&scpd_xml, control_url)
    }

    /// Searches for `T::URN`, resolving up to `options.take()` responding devices (or all
    /// of them within the timeout, if unbounded) into ready [`ScpdClient`]s.
    pub async fn search_for<T: ScpdService>(
        &self,
        options: SearchOptions,
    ) -> anyhow::Result<Vec<ScpdClient<T>>> {
        let urn = T::URN;
        let target_urn = Arc::new(urn.to_string());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancellation = CancellationToken::new();

        self.ssdp.search(&target_urn, options.timeout.as_secs()).await?;

        let filter_urn = target_urn.clone();
        let listen = self.ssdp.run(cancellation.clone(), move |info: DeviceNotificationInfo, _src| {
            if info.device_type == *filter_urn {
                let _ = tx.send(info);
            }
        });

        let mut out = Vec::new();
        let mut join_set: JoinSet<anyhow::Result<ScpdClient<T>>> = JoinSet::new();

        let collect = async {
            loop {
                tokio::select! {
                    Some(info) = rx.recv() => {
                        let Some(location) = info.location else { continue };
                        join_set.spawn(Self::build_scpd_client(
                            target_urn.clone(),
                            location,
                            self.fetch_client.clone(),
                        ));
                    }
                    Some(result) = join_set.join_next() => {
                        if let Ok(Ok(client)) = result {
                            out.push(client);
                            if options.take.is_some_and(|take| take == out.len()) {
                                return;
                            }
                        }
                    }
                    else => return,
                }
            }
        };

        let _ = tokio::time::timeout(options.timeout, async {
            tokio::select! {
                _ = listen => {}
                _ = collect => {}
            }
        })
        .await;
        cancellation.cancel();
        Ok(out)
    }
}
