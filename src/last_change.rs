//! `LastChange` event bodies: the GENA convention (used by RenderingControl, AVTransport
//! and friends) of batching several state-variable changes into one NOTIFY by carrying a
//! whole XML document as the text content of a single `LastChange` state variable.
//!
//! That document ends up double XML-escaped on the wire: once because it's itself XML
//! being embedded as text inside another XML document (the GENA event body), and once
//! more because this crate builds the GENA envelope by hand rather than through
//! `quick_xml`'s escaping writer. [`xml_escape_once`] applied twice reproduces exactly
//! what a conforming control point expects to unescape twice to recover the original
//! `<Event>` document.

use crate::xml_escape_once;

/// One `<VarName val="Value"/>` entry inside a `LastChange` event's `<InstanceID>`.
#[derive(Debug, Clone)]
struct ChangedVariable {
    name: String,
    value: String,
}

/// Builds a `LastChange` event body for a single service instance. Construct with the
/// service's metadata namespace (e.g. `urn:schemas-upnp-org:metadata-1-0/RCS/` for
/// RenderingControl), record the variables that changed with [`Self::set`], then hand the
/// finished body to [`crate::gena::SubscriptionTable::publish`].
#[derive(Debug, Clone)]
pub struct LastChangeEvent {
    metadata_ns: String,
    instance_id: u32,
    variables: Vec<ChangedVariable>,
}

impl LastChangeEvent {
    pub fn new(metadata_ns: impl Into<String>, instance_id: u32) -> Self {
        Self {
            metadata_ns: metadata_ns.into(),
            instance_id,
            variables: Vec::new(),
        }
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.push(ChangedVariable {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    fn inner_xml(&self) -> String {
        let mut vars = String::new();
        for var in &self.variables {
            vars.push_str(&format!(r#"<{} val="{}"/>"#, var.name, var.value));
        }
        format!(
            r#"<Event xmlns:e="{}"><InstanceID val="{}">{}</InstanceID></Event>"#,
            self.metadata_ns, self.instance_id, vars
        )
    }

    /// Builds the full GENA event body: a `<e:propertyset>` envelope carrying one
    /// `<e:property><LastChange>` whose text content is this event's inner XML, escaped
    /// twice over.
    pub fn into_body(self) -> String {
        let once = xml_escape_once(&self.inner_xml());
        let twice = xml_escape_once(&once);
        format!(
            concat!(
                "<?xml version=\"1.0\"?>",
                "<e:propertyset xmlns:e=\"urn:schemas-upnp-org:event-1-0\" ",
                "e:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">",
                "<e:property><LastChange>{}</LastChange></e:property>",
                "</e:propertyset>"
            ),
            twice
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_rendering_control_fixture() {
        let body = LastChangeEvent::new("urn:schemas-upnp-org:metadata-1-0/RCS/", 1)
            .set("VarName", "Value")
            .into_body();

        let expected = concat!(
            "<?xml version=\"1.0\"?>",
            "<e:propertyset xmlns:e=\"urn:schemas-upnp-org:event-1-0\" e:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">",
            "<e:property>",
            "<LastChange>&amp;lt;Event xmlns:e=&amp;quot;urn:schemas-upnp-org:metadata-1-0/RCS/&amp;quot;&amp;gt;&amp;lt;InstanceID val=&amp;quot;1&amp;quot;&amp;gt;&amp;lt;VarName val=&amp;quot;Value&amp;quot;/&amp;gt;&amp;lt;/InstanceID&amp;gt;&amp;lt;/Event&amp;gt;</LastChange>",
            "</e:property>",
            "</e:propertyset>"
        );

        assert_eq!(body, expected);
    }

    #[test]
    fn multiple_variables_are_all_carried() {
        let body = LastChangeEvent::new("urn:schemas-upnp-org:metadata-1-0/AVT/", 0)
            .set("TransportState", "PLAYING")
            .set("CurrentTrack", "3")
            .into_body();
        let once = xml_escape_once(
            r#"<Event xmlns:e="urn:schemas-upnp-org:metadata-1-0/AVT/"><InstanceID val="0"><TransportState val="PLAYING"/><CurrentTrack val="3"/></InstanceID></Event>"#,
        );
        let expected_inner = xml_escape_once(&once);
        assert!(body.contains(&expected_inner));
    }
}
