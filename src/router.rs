use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::{HeaderMap, Method},
    routing::{get, post, MethodFilter},
    Router,
};
use axum_extra::headers::{self, HeaderMapExt};

use crate::{
    action::{ActionError, ActionPayload, ActionResponse, IntoValueList, SoapMessage},
    device_description::DeviceDescription,
    gena,
    service::{Service, UpnpService},
};

/// Wraps an [`axum::Router`], nesting description/control/event endpoints under a single
/// path the way a UPnP root device publishes its whole surface under one base URL.
#[derive(Debug)]
pub struct UpnpRouter<S> {
    path: String,
    router: Router<S>,
}

impl<S> From<UpnpRouter<S>> for Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn from(upnp_router: UpnpRouter<S>) -> Self {
        Router::new().nest(&upnp_router.path, upnp_router.router)
    }
}

pub const DESC_PATH: &str = "/devicedesc.xml";

/// State shared by the handlers an [`UpnpRouter`] installs: the owning device's
/// description document (rendered once at startup) and the GENA subscription table
/// that backs SUBSCRIBE/UNSUBSCRIBE and outgoing NOTIFY delivery.
#[derive(Clone)]
pub struct UpnpState {
    pub description_xml: Arc<str>,
    pub subscriptions: gena::SubscriptionTable,
}

async fn handle_description(
    axum::extract::State(state): axum::extract::State<UpnpState>,
) -> (HeaderMap, String) {
    tracing::debug!("serving device description");
    let mut headers = HeaderMap::new();
    headers.typed_insert(headers::ContentType::xml());
    (headers, state.description_xml.to_string())
}

impl UpnpRouter<UpnpState> {
    pub fn new(path: &str, description: &DeviceDescription<'_>) -> anyhow::Result<Self> {
        let description_xml: Arc<str> = description.into_xml()?.into();
        let router = Router::new().route(DESC_PATH, get(handle_description));
        Ok(Self {
            path: path.to_string(),
            router,
        })
    }

    /// Registers `scpd.xml`/`control.xml` for `service`, plus `eventSubURL`'s
    /// SUBSCRIBE/UNSUBSCRIBE handling through the shared subscription table.
    pub fn register_service<S: Service + Send + Clone + 'static>(mut self, service: S) -> Self {
        let base_path = format!("/{}", S::NAME);
        let control_path = format!("{base_path}/control.xml");
        let scpd_path = format!("{base_path}/scpd.xml");
        let event_path = format!("{base_path}/event.xml");
        let service = Arc::new(UpnpService::new(service));

        let control_service = service.clone();
        let action_handler = move |headers: HeaderMap, body: String| {
            let service = control_service.clone();
            async move {
                let mut header = headers
                    .get("soapaction")
                    .context("soap_action header")?
                    .to_str()
                    .context("convert header to string")?;
                if let Some(stripped) = header.strip_prefix('"').and_then(|s| s.strip_suffix('"'))
                {
                    header = stripped;
                }
                let (_urn, action_name) =
                    header.split_once('#').context("split soapaction header")?;
                tracing::info!("action {action_name} invoked");

                let payload: SoapMessage<ActionPayload<_>> = SoapMessage::from_xml(body.as_bytes())?;
                let payload = payload.into_inner();
                if payload.name() != action_name {
                    tracing::warn!(
                        "mismatch between soapaction header and action payload: {} vs {}",
                        action_name,
                        payload.name(),
                    );
                }

                let expected_action = service.find_action(action_name)?;
                let scanner = expected_action.input_scanner(payload.arguments);

                let out_values = service
                    .s
                    .control_handler(action_name, scanner)
                    .await
                    .map_err(ActionError::from)?
                    .into_value_list();
                let args = expected_action.map_out_variables(out_values);

                Ok::<_, ActionError>(ActionResponse {
                    service_urn: S::URN,
                    action_name: action_name.to_string(),
                    args,
                })
            }
        };

        let scpd = S::service_description()
            .into_xml()
            .expect("statically declared services serialize without error");
        let scpd_handler = move || {
            let scpd = scpd.clone();
            async move {
                let mut headers = HeaderMap::new();
                headers.typed_insert(headers::ContentType::xml());
                let body = String::from_utf8(scpd).expect("scpd xml is utf-8");
                Ok::<_, ActionError>((headers, body))
            }
        };

        let event_service_urn = S::URN;
        let event_handler = move |method: Method, headers: HeaderMap, State(state): State<UpnpState>| {
            gena::handle_subscription_request(state.subscriptions, event_service_urn, method, headers)
        };

        self.router = self.router.route(&scpd_path, get(scpd_handler));
        self.router = self.router.route(&control_path, post(action_handler));
        self.router = self.router.route(
            &event_path,
            axum::routing::on(
                MethodFilter::try_from(Method::from_bytes(b"SUBSCRIBE").expect("valid method token"))
                    .expect("subscribe is a recognised method filter")
                    .or(
                        MethodFilter::try_from(Method::from_bytes(b"UNSUBSCRIBE").expect("valid method token"))
                            .expect("unsubscribe is a recognised method filter"),
                    ),
                event_handler,
            ),
        );
        self
    }
}
