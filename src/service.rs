use std::sync::Arc;

use crate::{
    action::{ActionError, ActionErrorCode, InArgumentPayload, IntoValueList},
    service_variables::IntoUpnpValue,
};

use super::{action::Action, templates::service_description::ServiceDescription, urn::URN};

/// A control-point-facing SCPD action surface: a service exposes a fixed set of named
/// actions and handles them by reading input arguments positionally off a scanner and
/// producing an output value list.
pub trait Service {
    const NAME: &str;
    const URN: URN;

    fn service_description() -> ServiceDescription;
    fn actions() -> Vec<Action>;
    fn control_handler<'a>(
        &self,
        name: &'a str,
        inputs: ArgumentScanner<'a>,
    ) -> impl std::future::Future<Output = anyhow::Result<impl IntoValueList>> + Send;
}

/// Walks a SOAP action's input arguments in declared order, decoding each into the type
/// the handler asks for. Positional, not name-checked: the wire order is dictated by the
/// action's `argumentList`, which callers are expected to honor.
#[derive(Debug, Clone)]
pub struct ArgumentScanner<'a> {
    payload: std::vec::IntoIter<InArgumentPayload<'a>>,
    expected_names: std::vec::IntoIter<&'a str>,
}

impl<'a> ArgumentScanner<'a> {
    pub fn new(payload: Vec<InArgumentPayload<'a>>, expected_names: Vec<&'a str>) -> Self {
        Self {
            payload: payload.into_iter(),
            expected_names: expected_names.into_iter(),
        }
    }

    /// Decodes the next argument without checking its wire name against the expected one;
    /// used by [`crate::action::ScannableArguments`] impls, which only have the value's
    /// target type to go on.
    pub fn next_unchecked<T: IntoUpnpValue>(&mut self) -> Result<T, ActionError> {
        let Some(_expected_next) = self.expected_names.next() else {
            return Err(ActionErrorCode::InvalidArguments.into());
        };
        let Some(next) = self.payload.next() else {
            return Err(ActionErrorCode::InvalidArguments.into());
        };
        T::from_xml_value(&next.value).map_err(|_| ActionErrorCode::ArgumentInvalid.into())
    }

    /// Decodes the next argument, additionally asserting its wire name matches what the
    /// action declares at this position.
    pub fn next<T: IntoUpnpValue>(&mut self) -> Result<T, ActionError> {
        let Some(expected_name) = self.expected_names.next() else {
            return Err(ActionErrorCode::InvalidArguments.into());
        };
        let Some(next) = self.payload.next() else {
            return Err(ActionErrorCode::InvalidArguments.into());
        };
        if next.name() != expected_name {
            return Err(ActionErrorCode::InvalidArguments.into());
        }
        T::from_xml_value(&next.value).map_err(|_| ActionErrorCode::ArgumentInvalid.into())
    }
}

/// Binds a [`Service`] implementation to its precomputed action table, so action lookup
/// by SOAP name doesn't walk a const fn every request.
#[derive(Debug, Clone)]
pub struct UpnpService<S: Service> {
    pub actions: Arc<Vec<Action>>,
    pub s: S,
}

impl<S: Service> UpnpService<S> {
    pub fn new(service: S) -> Self {
        let actions = Arc::new(S::actions());
        Self {
            actions,
            s: service,
        }
    }

    pub fn find_action(&self, name: &str) -> Result<&Action, ActionError> {
        self.actions
            .iter()
            .find(|a| a.name() == name)
            .ok_or_else(|| ActionErrorCode::InvalidAction.into())
    }
}
