//! Control-point-side SOAP action invocation against a remote service's `controlURL`,
//! driven by the action table fetched from that service's own SCPD document.

use std::marker::PhantomData;

use anyhow::Context;
use quick_xml::events::Event;

use crate::{
    action::{
        ActionError, ActionResponse, InArgumentPayload, ScannableArguments, SoapMessage,
        WritableAction, WriteableArguments,
    },
    error::ActionCallError,
    service::ArgumentScanner,
    urn::URN,
    XmlReaderExt,
};

/// One `<action>` entry off a service's SCPD: its name and the argument names declared
/// for each direction, in the order the service's control handler expects them.
#[derive(Debug, Clone)]
pub struct Action {
    name: String,
    pub in_args: Vec<String>,
    pub out_args: Vec<String>,
}

impl Action {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Reads a raw `scpd.xml` document and extracts just the action table: action name plus
/// in/out argument names, in declaration order. Other SCPD content (`serviceStateTable`)
/// isn't needed to drive a call, so it's skipped rather than modeled.
pub fn parse_scpd_actions(xml: &str) -> anyhow::Result<Vec<Action>> {
    let mut reader = quick_xml::Reader::from_str(xml);

    loop {
        let event = reader.read_event_err_eof()?;
        if let Event::Start(start) = event {
            if start.local_name().as_ref() == b"actionList" {
                break;
            }
        }
    }

    let mut actions = Vec::new();
    loop {
        match reader.read_event_err_eof()? {
            Event::Start(start) if start.local_name().as_ref() == b"action" => {
                actions.push(read_action(&mut reader)?);
            }
            Event::End(end) if end.local_name().as_ref() == b"actionList" => break,
            _ => {}
        }
    }
    Ok(actions)
}

fn read_action(r: &mut quick_xml::Reader<&[u8]>) -> anyhow::Result<Action> {
    let mut name = None;
    let mut in_args = Vec::new();
    let mut out_args = Vec::new();

    loop {
        match r.read_event_err_eof()? {
            Event::Start(start) if start.local_name().as_ref() == b"name" => {
                name = Some(r.read_text(start.name())?.to_string());
            }
            Event::Start(start) if start.local_name().as_ref() == b"argumentList" => {
                loop {
                    match r.read_event_err_eof()? {
                        Event::Start(start) if start.local_name().as_ref() == b"argument" => {
                            let (arg_name, direction) = read_argument(r)?;
                            match direction.as_str() {
                                "in" => in_args.push(arg_name),
                                "out" => out_args.push(arg_name),
                                other => anyhow::bail!("unexpected argument direction: {other}"),
                            }
                        }
                        Event::End(end) if end.local_name().as_ref() == b"argumentList" => break,
                        _ => {}
                    }
                }
            }
            Event::End(end) if end.local_name().as_ref() == b"action" => break,
            _ => {}
        }
    }

    Ok(Action {
        name: name.context("action name")?,
        in_args,
        out_args,
    })
}

fn read_argument(r: &mut quick_xml::Reader<&[u8]>) -> anyhow::Result<(String, String)> {
    let mut name = None;
    let mut direction = None;
    loop {
        match r.read_event_err_eof()? {
            Event::Start(start) if start.local_name().as_ref() == b"name" => {
                name = Some(r.read_text(start.name())?.to_string());
            }
            Event::Start(start) if start.local_name().as_ref() == b"direction" => {
                direction = Some(r.read_text(start.name())?.to_string());
            }
            Event::Start(start) => {
                r.read_to_end(start.name())?;
            }
            Event::End(end) if end.local_name().as_ref() == b"argument" => break,
            _ => {}
        }
    }
    Ok((name.context("argument name")?, direction.context("argument direction")?))
}

/// Ties a [`ScpdClient`] to the service URN its SOAPACTION headers must carry.
pub trait ScpdService: Send + 'static {
    const URN: URN;
}

/// Invokes actions against one remote service, using the action table its `scpd.xml`
/// declared at construction time to validate names and bind output arguments positionally.
#[derive(Debug)]
pub struct ScpdClient<T: ScpdService> {
    pub fetch_client: reqwest::Client,
    pub actions: Vec<Action>,
    pub control_url: String,
    _p: PhantomData<T>,
}

impl<T: ScpdService> ScpdClient<T> {
    pub fn new(scpd_xml: &str, control_url: String) -> anyhow::Result<Self> {
        let actions = parse_scpd_actions(scpd_xml)?;
        Ok(Self {
            actions,
            control_url,
            fetch_client: reqwest::Client::new(),
            _p: PhantomData,
        })
    }

    pub fn action(&self, name: &str) -> Result<&Action, ActionCallError> {
        self.actions
            .iter()
            .find(|a| a.name == name)
            .ok_or(ActionCallError::Parse(anyhow::anyhow!("no such action: {name}")))
    }

    /// Builds a call's request body from a caller-supplied argument tuple, in the order
    /// the action's SCPD entry declares its `in` arguments, then posts it and scans the
    /// response into `Out`.
    pub async fn call<Args: WriteableArguments, Out: ScannableArguments>(
        &self,
        action: &Action,
        args: Args,
    ) -> Result<Out, ActionCallError> {
        let mut writable = WritableAction::new(&action.name, T::URN)
            .map_err(|err| ActionCallError::Parse(err.into()))?;
        args.append_argument(action.in_args.iter().map(AsRef::as_ref), &mut writable)
            .map_err(ActionCallError::Parse)?;
        let payload = writable
            .finish()
            .map_err(|err| ActionCallError::Parse(err.into()))?;
        self.run_action(action, payload).await
    }

    pub async fn run_action<A: ScannableArguments>(
        &self,
        action: &Action,
        payload: String,
    ) -> Result<A, ActionCallError> {
        let header = format!("\"{}#{}\"", T::URN, action.name);
        let response = self
            .fetch_client
            .post(self.control_url())
            .header("SOAPAction", header)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(payload)
            .send()
            .await?;
        tracing::trace!("{} action response status: {}", action.name, response.status());
        let text = response.text().await?;

        let result: SoapMessage<Result<ActionResponse<InArgumentPayload>, ActionError>> =
            SoapMessage::from_xml(text.as_bytes()).map_err(ActionCallError::Parse)?;
        let response = result.into_inner().map_err(|fault| ActionCallError::Fault {
            code: fault.code.code(),
            description: fault.description,
        })?;

        let mut scanner = ArgumentScanner::new(
            response.args,
            action.out_args.iter().map(AsRef::as_ref).collect(),
        );
        A::scan_arguments(&mut scanner).map_err(|err| ActionCallError::Parse(anyhow::anyhow!(err)))
    }

    pub fn control_url(&self) -> &str {
        &self.control_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCPD_XML: &str = r#"<?xml version="1.0"?>
<scpd xmlns="urn:schemas-upnp-org:service-1-0">
  <actionList>
    <action>
      <name>Browse</name>
      <argumentList>
        <argument>
          <name>ObjectID</name>
          <direction>in</direction>
        </argument>
        <argument>
          <name>BrowseFlag</name>
          <direction>in</direction>
        </argument>
        <argument>
          <name>Result</name>
          <direction>out</direction>
        </argument>
        <argument>
          <name>NumberReturned</name>
          <direction>out</direction>
        </argument>
      </argumentList>
    </action>
    <action>
      <name>GetSearchCapabilities</name>
      <argumentList>
        <argument>
          <name>SearchCaps</name>
          <direction>out</direction>
        </argument>
      </argumentList>
    </action>
  </actionList>
</scpd>"#;

    #[test]
    fn scpd_actions_are_parsed_in_declaration_order_with_directions_split() {
        let actions = parse_scpd_actions(SCPD_XML).unwrap();
        assert_eq!(actions.len(), 2);

        let browse = &actions[0];
        assert_eq!(browse.name(), "Browse");
        assert_eq!(browse.in_args, vec!["ObjectID", "BrowseFlag"]);
        assert_eq!(browse.out_args, vec!["Result", "NumberReturned"]);

        let caps = &actions[1];
        assert_eq!(caps.name(), "GetSearchCapabilities");
        assert!(caps.in_args.is_empty());
        assert_eq!(caps.out_args, vec!["SearchCaps"]);
    }

    #[test]
    fn unknown_action_name_is_reported_rather_than_panicking() {
        struct FakeService;
        impl ScpdService for FakeService {
            const URN: URN = URN::service(crate::urn::ServiceType::ContentDirectory, 1);
        }

        let client: ScpdClient<FakeService> = ScpdClient {
            actions: parse_scpd_actions(SCPD_XML).unwrap(),
            control_url: "http://127.0.0.1:0/control".to_string(),
            fetch_client: reqwest::Client::new(),
            _p: PhantomData,
        };
        assert!(client.action("DoesNotExist").is_err());
        assert!(client.action("Browse").is_ok());
    }
}
