use std::{fmt::Display, str::FromStr};

use anyhow::Context;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    MediaServer,
    MediaRenderer,
    InternetGateway,
    Unknown,
}

impl From<&str> for DeviceType {
    fn from(value: &str) -> DeviceType {
        match value {
            "MediaServer" => DeviceType::MediaServer,
            "MediaRenderer" => DeviceType::MediaRenderer,
            "InternetGatewayDevice" => DeviceType::InternetGateway,
            _ => DeviceType::Unknown,
        }
    }
}

impl Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceType::MediaServer => "MediaServer",
            DeviceType::MediaRenderer => "MediaRenderer",
            DeviceType::InternetGateway => "InternetGatewayDevice",
            DeviceType::Unknown => "Unknown",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    ContentDirectory,
    AVTransport,
    RenderingControl,
    ConnectionManager,
    Unknown,
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceType::ContentDirectory => "ContentDirectory",
            ServiceType::AVTransport => "AVTransport",
            ServiceType::RenderingControl => "RenderingControl",
            ServiceType::ConnectionManager => "ConnectionManager",
            ServiceType::Unknown => "Unknown",
        };
        write!(f, "{name}")
    }
}

impl From<&str> for ServiceType {
    fn from(value: &str) -> ServiceType {
        match value {
            "ContentDirectory" => ServiceType::ContentDirectory,
            "AVTransport" => ServiceType::AVTransport,
            "RenderingControl" => ServiceType::RenderingControl,
            "ConnectionManager" => ServiceType::ConnectionManager,
            _ => ServiceType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrnType {
    Device(DeviceType),
    Service(ServiceType),
}

/// Uniform Resource Name. `urn:schemas-upnp-org:{device|service}:<kind>:<version>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct URN {
    pub version: u8,
    pub urn_type: UrnType,
}

impl Serialize for URN {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl URN {
    pub const fn device(kind: DeviceType, version: u8) -> Self {
        Self {
            version,
            urn_type: UrnType::Device(kind),
        }
    }

    pub const fn service(kind: ServiceType, version: u8) -> Self {
        Self {
            version,
            urn_type: UrnType::Service(kind),
        }
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        match self.urn_type {
            UrnType::Device(kind) => Some(kind),
            UrnType::Service(_) => None,
        }
    }

    pub fn service_type(&self) -> Option<ServiceType> {
        match self.urn_type {
            UrnType::Service(kind) => Some(kind),
            UrnType::Device(_) => None,
        }
    }

    /// A copy of this URN advertising a different version, used when rewriting an
    /// announce message to the version a search requested.
    pub fn with_version(self, version: u8) -> Self {
        Self { version, ..self }
    }
}

impl Display for URN {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (urn_type, name) = match &self.urn_type {
            UrnType::Device(device) => ("device", device.to_string()),
            UrnType::Service(service) => ("service", service.to_string()),
        };

        write!(
            f,
            "urn:schemas-upnp-org:{urn_type}:{name}:{version}",
            version = self.version
        )
    }
}

impl FromStr for URN {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(5, ':');
        let urn = parts.next().context("urn prefix")?;
        anyhow::ensure!(urn == "urn");
        let _schema = parts.next().context("schema")?;
        let schema_type = parts.next().context("schema_type")?;
        let name = parts.next().context("service/device name")?;
        let version = parts.next().context("service/device version")?.parse()?;
        let urn_type = match schema_type {
            "device" => UrnType::Device(DeviceType::from(name)),
            "service" => UrnType::Service(ServiceType::from(name)),
            rest => return Err(anyhow::anyhow!("unknown urn schema type: {rest}")),
        };
        Ok(URN { version, urn_type })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_urn_round_trips_for_every_recognised_kind() {
        let kinds = [
            ServiceType::ContentDirectory,
            ServiceType::AVTransport,
            ServiceType::RenderingControl,
            ServiceType::ConnectionManager,
        ];
        for kind in kinds {
            for version in 1..=255u8 {
                let urn = URN::service(kind, version);
                let parsed: URN = urn.to_string().parse().unwrap();
                assert_eq!(parsed.service_type(), Some(kind));
                assert_eq!(parsed.version, version);
            }
        }
    }

    #[test]
    fn device_urn_round_trips_for_every_recognised_kind() {
        let kinds = [
            DeviceType::MediaServer,
            DeviceType::MediaRenderer,
            DeviceType::InternetGateway,
        ];
        for kind in kinds {
            let urn = URN::device(kind, 2);
            let parsed: URN = urn.to_string().parse().unwrap();
            assert_eq!(parsed.device_type(), Some(kind));
        }
    }

    #[test]
    fn wan_device_urn_parses() {
        let urn: URN = "urn:schemas-upnp-org:device:WANDevice:1".parse().unwrap();
        assert_eq!(urn.device_type(), Some(DeviceType::Unknown));
        assert_eq!(urn.version, 1);
    }
}
