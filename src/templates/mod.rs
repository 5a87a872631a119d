use anyhow::Context;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};

use crate::{FromXml, IntoXml, XmlReaderExt};

pub mod service_description;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecVersion {
    pub major: usize,
    pub minor: usize,
}

impl SpecVersion {
    /// UPnP2.0 spec version
    pub const fn upnp_v2() -> Self {
        Self { major: 2, minor: 0 }
    }
    pub const fn upnp_v1_1() -> Self {
        Self { major: 1, minor: 1 }
    }
    pub const fn upnp_v1() -> Self {
        Self { major: 1, minor: 0 }
    }
}

impl IntoXml for SpecVersion {
    fn write_xml(&self, w: &mut crate::XmlWriter) -> quick_xml::Result<()> {
        w.write_serializable("specVersion", self)
            .expect("serialization not fail");
        Ok(())
    }
}

impl<'a> FromXml<'a> for SpecVersion {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let start = r.read_to_start()?;
        anyhow::ensure!(start.local_name().as_ref() == b"specVersion");
        let mut major = None;
        let mut minor = None;
        loop {
            match r.read_event_err_eof()? {
                Event::Start(tag) => {
                    let end_name = tag.name();
                    match tag.local_name().as_ref() {
                        b"major" => major = Some(r.read_text(end_name)?.parse()?),
                        b"minor" => minor = Some(r.read_text(end_name)?.parse()?),
                        _ => {
                            r.read_to_end(end_name)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"specVersion");
                    break;
                }
                Event::Text(_) => {}
                e => anyhow::bail!("expected specVersion field or end, got {:?}", e),
            }
        }
        Ok(Self {
            major: major.context("major")?,
            minor: minor.context("minor")?,
        })
    }
}
