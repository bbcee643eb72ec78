//! The invocation pipeline: decode, authenticate, verify, look up, gate,
//! execute, encode.
//!
//! Every failure short-circuits into a classified [`DispatchError`] and
//! leaves the connection alive; handler panics aside, nothing a client
//! sends can take the pipeline down.

use std::sync::Arc;

use meshlink_core::{
    decode_payload, encode_payload, signature, CapabilitiesResponse, DiscoveryRequest,
    DispatchError, MethodRequest, MethodResponse,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::auth::AuthProvider;
use crate::events::EventBroker;
use crate::registry::MethodRegistry;

/// Core request dispatcher shared by every transport handler.
///
/// Owns the registry and the event broker; authentication is delegated to
/// the injected [`AuthProvider`]. Cheap to share behind an `Arc`.
pub struct DispatchServer {
    auth: Arc<AuthProvider>,
    registry: MethodRegistry,
    broker: Arc<EventBroker>,
}

impl DispatchServer {
    /// Builds a dispatcher with the builtin `ping` and `echo` methods
    /// pre-registered under the `read` permission.
    #[must_use]
    pub fn new(auth: Arc<AuthProvider>) -> Self {
        let registry = MethodRegistry::new();
        registry.register_fn("ping", "read", |_params, _client_id| {
            Ok(json!({
                "status": "ok",
                "timestamp": signature::unix_timestamp(),
            }))
        });
        registry.register_fn("echo", "read", |params, _client_id| Ok(params));

        Self {
            auth,
            registry,
            broker: Arc::new(EventBroker::default()),
        }
    }

    #[must_use]
    pub fn auth(&self) -> &Arc<AuthProvider> {
        &self.auth
    }

    #[must_use]
    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    #[must_use]
    pub fn broker(&self) -> Arc<EventBroker> {
        Arc::clone(&self.broker)
    }

    /// Runs a request through the full pipeline and always produces a
    /// response correlated to the request id.
    pub async fn invoke(&self, request: MethodRequest) -> MethodResponse {
        debug!(
            method_id = %request.method_id,
            client_id = %request.client_id,
            request_id = %request.request_id,
            "dispatching method invocation"
        );
        match self.invoke_inner(&request).await {
            Ok(result) => MethodResponse::success(request.request_id, result),
            Err(err) => {
                warn!(
                    method_id = %request.method_id,
                    client_id = %request.client_id,
                    error = %err,
                    "method invocation failed"
                );
                MethodResponse::failure(request.request_id, err.status(), err.to_string())
            }
        }
    }

    async fn invoke_inner(&self, request: &MethodRequest) -> Result<Vec<u8>, DispatchError> {
        self.auth
            .authenticate(&request.client_id, &request.api_key)
            .ok_or(DispatchError::AuthenticationFailed)?;

        if !self.auth.validate_signature(
            &request.client_id,
            &request.method_id,
            request.timestamp,
            &request.signature,
        ) {
            return Err(DispatchError::InvalidSignature);
        }

        let method = self
            .registry
            .get(&request.method_id)
            .ok_or_else(|| DispatchError::MethodNotFound {
                method_id: request.method_id.clone(),
            })?;

        if !self
            .auth
            .has_permission(&request.client_id, &method.required_permission)
        {
            return Err(DispatchError::PermissionDenied {
                required: method.required_permission,
            });
        }

        // Parameter decoding and handler execution both classify as
        // execution errors, matching the advertised ERROR status.
        let params: Value = decode_payload(&request.parameters)
            .map_err(|err| DispatchError::Handler(err.to_string()))?;
        let result = method
            .handler
            .execute(params, &request.client_id)
            .await
            .map_err(|err| DispatchError::Handler(err.to_string()))?;
        encode_payload(&result).map_err(|err| DispatchError::Handler(err.to_string()))
    }

    /// Capability discovery: authenticates the caller and projects the
    /// registry down to what their permissions allow. No signature is
    /// required; discovery reveals nothing a permitted invocation would not.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::AuthenticationFailed`] on an invalid
    /// client id / API key pair.
    pub fn discover(
        &self,
        request: &DiscoveryRequest,
    ) -> Result<CapabilitiesResponse, DispatchError> {
        let permissions = self
            .auth
            .authenticate(&request.client_id, &request.api_key)
            .ok_or(DispatchError::AuthenticationFailed)?;

        let capabilities = self
            .registry
            .capabilities_where(|required| permissions.contains(required));
        debug!(
            client_id = %request.client_id,
            count = capabilities.len(),
            "capability discovery"
        );
        Ok(CapabilitiesResponse { capabilities })
    }
}
