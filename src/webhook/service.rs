//! Service mutation handler
//!
//! Handles AdmissionReview requests for Services, allocating NodePorts for
//! zero-valued entries and validating explicit ones. Only NodePort Services
//! are touched; everything else is admitted unchanged.

use std::sync::Arc;

use axum::{extract::State, Json};
use json_patch::{PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
};
use tracing::{debug, error, info, warn};

use crate::allocator::{is_node_port, service_key, service_labels, service_namespace};
use crate::manager::Manager;

use super::WebhookState;

/// Result of processing one Service through the allocator
#[derive(Debug, Default)]
pub struct ServiceMutation {
    /// Whether the Service is admitted
    pub allowed: bool,
    /// Denial reason when not allowed
    pub message: String,
    /// JSON-Patch operations setting auto-allocated ports
    pub patches: Vec<PatchOperation>,
    /// Allocation messages surfaced as admission warnings
    pub warnings: Vec<String>,
}

/// Handle a mutating admission review for Services
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = mutate_service(&state, &req).await;
    Json(response.into_review())
}

async fn mutate_service(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let uid = request.uid.clone();

    if request.kind.kind != "Service" || !request.kind.group.is_empty() {
        debug!(uid = %uid, kind = %request.kind.kind, "not a core Service, allowing unchanged");
        return AdmissionResponse::from(request);
    }

    let obj = match &request.object {
        Some(obj) => obj,
        None => {
            debug!(uid = %uid, "no object in request, allowing unchanged");
            return AdmissionResponse::from(request);
        }
    };

    let svc: Service = match serde_json::to_value(obj).and_then(serde_json::from_value) {
        Ok(svc) => svc,
        Err(e) => {
            error!(uid = %uid, error = %e, "failed to decode Service");
            return deny(request, format!("failed to decode Service: {}", e));
        }
    };

    if !is_node_port(&svc) {
        debug!(uid = %uid, service = %service_key(&svc), "not a NodePort Service, allowing unchanged");
        return AdmissionResponse::from(request);
    }

    info!(
        uid = %uid,
        service = %service_key(&svc),
        operation = ?request.operation,
        "processing NodePort Service"
    );

    let mutation = process_service(&state.manager, &svc, &request.operation).await;

    if !mutation.allowed {
        warn!(uid = %uid, service = %service_key(&svc), reason = %mutation.message, "denying Service");
        return deny(request, mutation.message);
    }

    let mut response = AdmissionResponse::from(request);

    if !mutation.patches.is_empty() {
        info!(uid = %uid, patches = mutation.patches.len(), "applying NodePort patches");
        response = match response.with_patch(json_patch::Patch(mutation.patches)) {
            Ok(response) => response,
            Err(e) => {
                error!(uid = %uid, error = %e, "failed to serialize patch");
                return deny(request, format!("patch serialization error: {}", e));
            }
        };
    }

    if !mutation.warnings.is_empty() {
        response.warnings = Some(mutation.warnings);
    }

    response
}

/// Run a Service through allocation or validation
///
/// Creates, and updates that still carry unassigned ports, go through the
/// full allocation transaction. Updates with every port set are validated
/// against range bounds only; their occupancy was arbitrated when the ports
/// were first granted.
pub async fn process_service(
    manager: &Arc<Manager>,
    svc: &Service,
    operation: &Operation,
) -> ServiceMutation {
    let needs_allocation = service_ports(svc)
        .iter()
        .any(|p| p.node_port.unwrap_or(0) == 0);

    if needs_allocation || matches!(operation, Operation::Create) {
        allocate(manager, svc).await
    } else if matches!(operation, Operation::Update) {
        validate(manager, svc)
    } else {
        ServiceMutation {
            allowed: true,
            ..Default::default()
        }
    }
}

async fn allocate(manager: &Arc<Manager>, svc: &Service) -> ServiceMutation {
    let results = match manager.allocator().allocate_for_service(svc).await {
        Ok(results) => results,
        Err(e) => {
            return ServiceMutation {
                allowed: false,
                message: e.to_string(),
                ..Default::default()
            }
        }
    };

    let ports = service_ports(svc);
    let mut mutation = ServiceMutation {
        allowed: true,
        ..Default::default()
    };

    for result in results {
        // Only originally unassigned entries need a patch; explicitly
        // requested ports are already in the object.
        let was_unset = ports
            .get(result.port_index)
            .is_some_and(|p| p.node_port.unwrap_or(0) == 0);
        if was_unset {
            mutation.patches.push(PatchOperation::Replace(ReplaceOperation {
                path: PointerBuf::from_tokens([
                    "spec",
                    "ports",
                    result.port_index.to_string().as_str(),
                    "nodePort",
                ]),
                value: serde_json::Value::from(result.allocated_port),
            }));
        }
        mutation.warnings.push(result.message);
    }

    mutation
}

fn validate(manager: &Arc<Manager>, svc: &Service) -> ServiceMutation {
    let namespace = service_namespace(svc);
    let labels = service_labels(svc);

    for port in service_ports(svc) {
        let node_port = port.node_port.unwrap_or(0);
        if node_port == 0 {
            continue;
        }
        if let Err(e) = manager.validate_port_for_service(namespace, &labels, node_port) {
            return ServiceMutation {
                allowed: false,
                message: format!("port {} validation failed: {}", node_port, e),
                ..Default::default()
            };
        }
    }

    ServiceMutation {
        allowed: true,
        ..Default::default()
    }
}

fn deny(request: &AdmissionRequest<DynamicObject>, message: impl ToString) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request).deny(message);
    response.result.code = 403;
    response
}

fn service_ports(svc: &Service) -> &[k8s_openapi::api::core::v1::ServicePort] {
    svc.spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or(&[])
}
