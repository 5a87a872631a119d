//! GENA (General Event Notification Architecture) subscription fabric: the server-side
//! table backing SUBSCRIBE/RENEW/UNSUBSCRIBE on a service's `eventSubURL`, outgoing NOTIFY
//! delivery to subscribers, and the control-point-side client plus the embedded endpoint a
//! control point exposes to receive those NOTIFYs back.

use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::{HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::{post, MethodRouter},
    Router,
};
use dashmap::DashMap;
use reqwest::Client;
use uuid::Uuid;

use crate::urn::URN;

/// Subscription identifier handed back on SUBSCRIBE and presented on every RENEW/UNSUBSCRIBE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sid(Uuid);

impl Sid {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for Sid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "uuid:{}", self.0)
    }
}

impl std::str::FromStr for Sid {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = s.strip_prefix("uuid:").unwrap_or(s);
        Ok(Self(Uuid::parse_str(uuid).context("parse sid uuid")?))
    }
}

const DEFAULT_TIMEOUT_SECS: u64 = 1800;
const MIN_TIMEOUT_SECS: u64 = 30;

/// Parses a GENA `TIMEOUT` header (`Second-1800` or `Second-infinite`). `infinite` is
/// accepted on the wire but clamped to an hour, matching the teacher's stance on
/// unbounded-interval requests elsewhere in this crate: nothing in this runtime waits
/// forever on a peer's say-so.
fn parse_timeout_header(value: Option<&str>) -> Duration {
    let Some(value) = value else {
        return Duration::from_secs(DEFAULT_TIMEOUT_SECS);
    };
    match value.strip_prefix("Second-") {
        Some("infinite") => Duration::from_secs(3600),
        Some(digits) => digits
            .parse::<u64>()
            .map(|secs| Duration::from_secs(secs.max(MIN_TIMEOUT_SECS)))
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
    }
}

fn format_timeout_header(timeout: Duration) -> String {
    format!("Second-{}", timeout.as_secs())
}

/// Formats the current time as an HTTP-style `DATE` header value, as GENA responses and
/// NOTIFYs both carry alongside their subscription headers.
fn http_date_now() -> String {
    const FORMAT: &[time::format_description::FormatItem<'_>] = time::macros::format_description!(
        "[weekday repr:short], [day padding:zero] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    time::OffsetDateTime::now_utc()
        .format(FORMAT)
        .unwrap_or_else(|_| String::new())
}

/// Parses the `CALLBACK` header's `<url1><url2>...` list into individual URLs, in order.
fn parse_callback_header(value: &str) -> Vec<reqwest::Url> {
    value
        .split('>')
        .filter_map(|chunk| chunk.trim().strip_prefix('<'))
        .filter_map(|url| reqwest::Url::parse(url).ok())
        .collect()
}

/// Decides what a new SUBSCRIBE gets: the timeout actually granted (which may differ from
/// what the subscriber asked for) and the body of the initial event GENA requires be sent
/// the moment the subscription is accepted. Installed once per [`SubscriptionTable`]; a
/// table with none installed refuses every new SUBSCRIBE with `412 Precondition Failed`,
/// since there would be nothing to report and no way to choose a timeout.
pub trait SubscriptionHandler: Clone + Send + Sync + 'static {
    fn on_subscribe(
        &self,
        service_urn: URN,
        requested_timeout: Duration,
    ) -> impl std::future::Future<Output = (Duration, String)> + Send;
}

type BoxedSubscribeFuture = Pin<Box<dyn std::future::Future<Output = (Duration, String)> + Send>>;
type BoxedSubscribeHandler = Arc<dyn Fn(URN, Duration) -> BoxedSubscribeFuture + Send + Sync>;

fn box_subscription_handler<H: SubscriptionHandler>(handler: H) -> BoxedSubscribeHandler {
    Arc::new(move |service_urn, requested_timeout| {
        let handler = handler.clone();
        Box::pin(async move { handler.on_subscribe(service_urn, requested_timeout).await })
    })
}

#[derive(Debug)]
struct Subscription {
    service_urn: URN,
    callbacks: Vec<reqwest::Url>,
    timeout: Duration,
    expires_at: Instant,
    sequence: AtomicU32,
}

impl Subscription {
    fn renew(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.expires_at = Instant::now() + timeout;
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Concurrent map of active subscriptions, shared between every registered service's
/// event endpoint and whatever task pushes state-variable changes out as NOTIFYs.
#[derive(Clone, Default)]
pub struct SubscriptionTable {
    subscriptions: Arc<DashMap<Sid, Subscription>>,
    http: Client,
    handler: Option<BoxedSubscribeHandler>,
}

impl std::fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionTable")
            .field("subscriptions", &self.subscriptions)
            .field("handler_installed", &self.handler.is_some())
            .finish()
    }
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the handler new SUBSCRIBEs are dispatched to. Without one, every new
    /// subscription attempt is refused.
    pub fn with_subscription_handler<H: SubscriptionHandler>(mut self, handler: H) -> Self {
        self.handler = Some(box_subscription_handler(handler));
        self
    }

    fn subscribe(&self, service_urn: URN, callbacks: Vec<reqwest::Url>, timeout: Duration) -> Sid {
        let sid = Sid::new();
        self.subscriptions.insert(
            sid,
            Subscription {
                service_urn,
                callbacks,
                timeout,
                expires_at: Instant::now() + timeout,
                sequence: AtomicU32::new(0),
            },
        );
        sid
    }

    fn renew(&self, sid: Sid, timeout: Duration) -> Option<Duration> {
        let mut entry = self.subscriptions.get_mut(&sid)?;
        entry.renew(timeout);
        Some(timeout)
    }

    fn unsubscribe(&self, sid: Sid) -> bool {
        self.subscriptions.remove(&sid).is_some()
    }

    /// Drops every subscription whose TIMEOUT has elapsed without a RENEW. Callers run this
    /// periodically; a lookup or renew racing a sweep just loses, same as a lookup racing
    /// an UNSUBSCRIBE.
    pub fn sweep_expired(&self) {
        self.subscriptions.retain(|_, sub| !sub.is_expired());
    }

    /// Sends a NOTIFY carrying `body` (already-built event XML) to every active subscriber
    /// of `service_urn`, incrementing each subscriber's own sequence counter. Delivery is
    /// best-effort: GENA gives no redelivery guarantee, so a failed POST is logged and
    /// otherwise ignored.
    pub async fn publish(&self, service_urn: URN, body: String) {
        let targets: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.service_urn == service_urn)
            .map(|entry| (*entry.key(), entry.callbacks.clone()))
            .collect();

        for (sid, callbacks) in targets {
            let Some(seq) = self
                .subscriptions
                .get(&sid)
                .map(|sub| sub.sequence.fetch_add(1, Ordering::SeqCst))
            else {
                continue;
            };
            self.notify_one(sid, seq, &callbacks, &body).await;
        }
    }

    /// Convenience wrapper over [`Self::publish`] for services that model their state as
    /// a batched `LastChange` event rather than publishing a raw body directly.
    pub async fn publish_last_change(&self, service_urn: URN, event: crate::last_change::LastChangeEvent) {
        self.publish(service_urn, event.into_body()).await;
    }

    async fn notify_one(&self, sid: Sid, seq: u32, callbacks: &[reqwest::Url], body: &str) {
        for callback in callbacks {
            let result = self
                .http
                .request(
                    reqwest::Method::from_bytes(b"NOTIFY").expect("notify is a valid method token"),
                    callback.clone(),
                )
                .header("CONTENT-TYPE", "text/xml; charset=\"utf-8\"")
                .header("NT", "upnp:event")
                .header("NTS", "upnp:propchange")
                .header("SID", sid.to_string())
                .header("SEQ", seq.to_string())
                .header("DATE", http_date_now())
                .body(body.to_string())
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => return,
                Ok(response) => {
                    tracing::warn!(%sid, status = %response.status(), "notify rejected by subscriber");
                }
                Err(err) => {
                    tracing::warn!(%sid, %err, "notify delivery failed");
                }
            }
        }
    }

    /// Sends the mandatory initial event for a just-accepted subscription with `SEQ:0`,
    /// off the request-handling path so the SUBSCRIBE response isn't held up waiting on
    /// it. Bumps the subscription's sequence counter to 1 first, so the first `publish()`
    /// afterwards doesn't repeat `SEQ:0`.
    fn spawn_initial_notify(&self, sid: Sid, callbacks: Vec<reqwest::Url>, body: String) {
        if let Some(sub) = self.subscriptions.get(&sid) {
            sub.sequence.store(1, Ordering::SeqCst);
        }
        let table = self.clone();
        tokio::spawn(async move {
            table.notify_one(sid, 0, &callbacks, &body).await;
        });
    }
}

/// Handles a SUBSCRIBE/UNSUBSCRIBE (RENEW is a SUBSCRIBE carrying an existing SID) request
/// against a service's `eventSubURL`, per GENA's header contract.
pub async fn handle_subscription_request(
    table: SubscriptionTable,
    service_urn: URN,
    method: Method,
    headers: HeaderMap,
) -> axum::response::Response {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    match method.as_str() {
        "SUBSCRIBE" => {
            let sid = header("SID").map(str::parse::<Sid>);
            let callback = header("CALLBACK");
            let nt = header("NT");
            let timeout = parse_timeout_header(header("TIMEOUT"));

            match (sid, callback, nt) {
                // RENEW: an existing SID with neither CALLBACK nor NT.
                (Some(Ok(sid)), None, None) => match table.renew(sid, timeout) {
                    Some(timeout) => subscribe_response(sid, timeout),
                    None => StatusCode::PRECONDITION_FAILED.into_response(),
                },
                // A SID alongside CALLBACK/NT is malformed per the GENA header contract.
                (Some(_), _, _) => StatusCode::BAD_REQUEST.into_response(),
                // New subscription: CALLBACK and NT: upnp:event are both required.
                (None, Some(callback), Some("upnp:event")) => {
                    let callbacks = parse_callback_header(callback);
                    if callbacks.is_empty() {
                        return StatusCode::PRECONDITION_FAILED.into_response();
                    }
                    let Some(handler) = table.handler.clone() else {
                        return StatusCode::PRECONDITION_FAILED.into_response();
                    };
                    let (chosen_timeout, initial_event) = handler(service_urn, timeout).await;
                    let sid = table.subscribe(service_urn, callbacks.clone(), chosen_timeout);
                    tracing::info!(%sid, "new subscription");
                    let response = subscribe_response(sid, chosen_timeout);
                    table.spawn_initial_notify(sid, callbacks, initial_event);
                    response
                }
                (None, _, _) => StatusCode::PRECONDITION_FAILED.into_response(),
            }
        }
        "UNSUBSCRIBE" => match header("SID").map(str::parse::<Sid>) {
            Some(Ok(sid)) if table.unsubscribe(sid) => {
                tracing::info!(%sid, "unsubscribed");
                StatusCode::OK.into_response()
            }
            Some(Ok(_)) => StatusCode::PRECONDITION_FAILED.into_response(),
            _ => StatusCode::BAD_REQUEST.into_response(),
        },
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

fn subscribe_response(sid: Sid, timeout: Duration) -> axum::response::Response {
    let mut headers = HeaderMap::new();
    headers.insert("SID", sid.to_string().parse().expect("sid is header-safe"));
    headers.insert(
        "TIMEOUT",
        format_timeout_header(timeout)
            .parse()
            .expect("timeout header is header-safe"),
    );
    headers.insert("DATE", http_date_now().parse().expect("date header is header-safe"));
    (StatusCode::OK, headers).into_response()
}

/// Control-point-side GENA client: subscribes to a service's `eventSubURL`, renews before
/// expiry and unsubscribes on drop-of-interest.
#[derive(Debug, Clone)]
pub struct GenaClient {
    http: Client,
}

/// A subscription held by a control point, tracking enough to drive renewal.
#[derive(Debug, Clone)]
pub struct ActiveSubscription {
    pub sid: Sid,
    pub timeout: Duration,
}

impl Default for GenaClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GenaClient {
    pub fn new() -> Self {
        Self { http: Client::new() }
    }

    pub async fn subscribe(
        &self,
        event_sub_url: &reqwest::Url,
        callback_url: &reqwest::Url,
        timeout: Duration,
    ) -> Result<ActiveSubscription, crate::error::ActionCallError> {
        let response = self
            .http
            .request(
                reqwest::Method::from_bytes(b"SUBSCRIBE").expect("subscribe is a valid method token"),
                event_sub_url.clone(),
            )
            .header("CALLBACK", format!("<{callback_url}>"))
            .header("NT", "upnp:event")
            .header("TIMEOUT", format_timeout_header(timeout))
            .send()
            .await?;
        self.read_subscribe_response(response).await
    }

    pub async fn renew(
        &self,
        event_sub_url: &reqwest::Url,
        sid: Sid,
        timeout: Duration,
    ) -> Result<ActiveSubscription, crate::error::ActionCallError> {
        let response = self
            .http
            .request(
                reqwest::Method::from_bytes(b"SUBSCRIBE").expect("subscribe is a valid method token"),
                event_sub_url.clone(),
            )
            .header("SID", sid.to_string())
            .header("TIMEOUT", format_timeout_header(timeout))
            .send()
            .await?;
        self.read_subscribe_response(response).await
    }

    pub async fn unsubscribe(
        &self,
        event_sub_url: &reqwest::Url,
        sid: Sid,
    ) -> Result<(), crate::error::ActionCallError> {
        let response = self
            .http
            .request(
                reqwest::Method::from_bytes(b"UNSUBSCRIBE")
                    .expect("unsubscribe is a valid method token"),
                event_sub_url.clone(),
            )
            .header("SID", sid.to_string())
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::PRECONDITION_FAILED {
            return Err(crate::error::ActionCallError::PreconditionFailed);
        }
        Ok(())
    }

    async fn read_subscribe_response(
        &self,
        response: reqwest::Response,
    ) -> Result<ActiveSubscription, crate::error::ActionCallError> {
        if response.status() == reqwest::StatusCode::PRECONDITION_FAILED {
            return Err(crate::error::ActionCallError::PreconditionFailed);
        }
        if !response.status().is_success() {
            return Err(crate::error::ActionCallError::Fault {
                code: response.status().as_u16(),
                description: None,
            });
        }
        let sid: Sid = response
            .headers()
            .get("SID")
            .and_then(|v| v.to_str().ok())
            .context("missing SID header")
            .and_then(str::parse)
            .map_err(crate::error::ActionCallError::Parse)?;
        let timeout = parse_timeout_header(response.headers().get("TIMEOUT").and_then(|v| v.to_str().ok()));
        Ok(ActiveSubscription { sid, timeout })
    }
}

/// What a control point does with an incoming event: `sid` identifies which subscription
/// it belongs to, `seq` is the publisher's monotonically increasing counter, `body` is the
/// (still xml-escaped) `LastChange`-style payload.
pub trait EventSink: Clone + Send + Sync + 'static {
    fn on_event(
        &self,
        sid: Sid,
        seq: u32,
        body: String,
    ) -> impl std::future::Future<Output = ()> + Send;
}

async fn notify_handler<S: EventSink>(
    State(sink): State<S>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let Some(sid) = headers
        .get("SID")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<Sid>().ok())
    else {
        return StatusCode::BAD_REQUEST;
    };
    let seq = headers
        .get("SEQ")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    sink.on_event(sid, seq, body).await;
    StatusCode::OK
}

/// Builds the embedded endpoint a control point exposes for its CALLBACK url: NOTIFY
/// delivery is handled here and handed off to `sink`. Nested into whatever router the
/// control point already runs, the same way a device's own service endpoints nest under
/// [`crate::router::UpnpRouter`].
pub fn notify_receiver<S: EventSink>(sink: S) -> Router<()> {
    let route: MethodRouter<S> = post(notify_handler::<S>).merge(on_notify_method::<S>());
    Router::new().route("/", route).with_state(sink)
}

fn on_notify_method<S: EventSink>() -> MethodRouter<S> {
    use axum::routing::{on, MethodFilter};
    on(
        MethodFilter::try_from(Method::from_bytes(b"NOTIFY").expect("valid method token"))
            .expect("notify is a recognised method filter"),
        notify_handler::<S>,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_urn() -> URN {
        URN::service(crate::urn::ServiceType::ContentDirectory, 1)
    }

    #[test]
    fn timeout_header_round_trips() {
        let parsed = parse_timeout_header(Some("Second-120"));
        assert_eq!(parsed, Duration::from_secs(120));
        assert_eq!(format_timeout_header(parsed), "Second-120");
    }

    #[test]
    fn timeout_header_defaults_when_absent() {
        assert_eq!(parse_timeout_header(None), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[test]
    fn callback_header_parses_multiple_urls() {
        let urls = parse_callback_header("<http://192.168.1.5:4004/event><http://192.168.1.5:4004/event2>");
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0].as_str(), "http://192.168.1.5:4004/event");
    }

    #[tokio::test]
    async fn subscribe_then_renew_then_unsubscribe() {
        let table = SubscriptionTable::new();
        let sid = table.subscribe(
            test_urn(),
            vec![reqwest::Url::parse("http://127.0.0.1:9/event").unwrap()],
            Duration::from_secs(60),
        );
        assert!(table.renew(sid, Duration::from_secs(120)).is_some());
        assert!(table.unsubscribe(sid));
        assert!(table.renew(sid, Duration::from_secs(60)).is_none());
    }

    #[tokio::test]
    async fn expired_subscription_is_swept() {
        let table = SubscriptionTable::new();
        let sid = table.subscribe(
            test_urn(),
            vec![reqwest::Url::parse("http://127.0.0.1:9/event").unwrap()],
            Duration::from_millis(1),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        table.sweep_expired();
        assert!(table.renew(sid, Duration::from_secs(60)).is_none());
    }

    #[derive(Clone)]
    struct FixedTimeoutHandler;

    impl SubscriptionHandler for FixedTimeoutHandler {
        async fn on_subscribe(&self, _service_urn: URN, _requested_timeout: Duration) -> (Duration, String) {
            (Duration::from_secs(120), "<e:propertyset/>".to_string())
        }
    }

    #[tokio::test]
    async fn new_subscription_without_handler_is_refused() {
        let table = SubscriptionTable::new();
        let response = handle_subscription_request(
            table,
            test_urn(),
            Method::from_bytes(b"SUBSCRIBE").unwrap(),
            {
                let mut headers = HeaderMap::new();
                headers.insert("CALLBACK", "<http://127.0.0.1:9/event>".parse().unwrap());
                headers.insert("NT", "upnp:event".parse().unwrap());
                headers
            },
        )
        .await;
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn new_subscription_with_handler_uses_its_timeout_and_sequence_starts_at_one() {
        let table = SubscriptionTable::new().with_subscription_handler(FixedTimeoutHandler);
        let response = handle_subscription_request(
            table.clone(),
            test_urn(),
            Method::from_bytes(b"SUBSCRIBE").unwrap(),
            {
                let mut headers = HeaderMap::new();
                headers.insert("CALLBACK", "<http://127.0.0.1:9/event>".parse().unwrap());
                headers.insert("NT", "upnp:event".parse().unwrap());
                headers
            },
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("TIMEOUT").and_then(|v| v.to_str().ok()),
            Some("Second-120")
        );
        let sid: Sid = response
            .headers()
            .get("SID")
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(
            table
                .subscriptions
                .get(&sid)
                .unwrap()
                .sequence
                .load(Ordering::SeqCst),
            1
        );
    }
}
