//! The operator-facing HTTP API: record management, device administration,
//! health, and metrics, built on the wire types in `meshgate_api`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use meshgate_api::{
    AddRecordRequest, AnnotateDeviceError, AnnotateDeviceRequest, ComponentHealth as ApiComponentHealth,
    CreateRecordError, DeviceStorageInfo, DeviceView, HealthResponse, HealthStatus, ListDevicesResult,
    ProxyRuleView, Record, RecordType, RemoveRecordError, RemoveRecordRequest, Scheme as ApiScheme,
};

use crate::center::{Center, Update};
use crate::inventory::InventoryError;
use crate::proxy::{ProxyRule, Scheme};
use crate::records::{CreateRecordRequest, RecordEntry, RecordError};

/// Build the router. `center` is cloned into every handler's state.
pub fn router(center: Arc<Center>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/add-record", post(add_record))
        .route("/list-records", get(list_records))
        .route("/remove-record", post(remove_record))
        .route("/list-devices", get(list_devices))
        .route("/annotate-device", post(annotate_device))
        .route("/device-storage-info", get(device_storage_info));

    if center.config.metrics.enabled {
        router = router.route(&center.config.metrics.path.clone(), get(metrics));
    }

    router.with_state(center)
}

//----------- /health ---------------------------------------------------------------

async fn health(State(center): State<Arc<Center>>) -> impl IntoResponse {
    let report = center.health.check_all(&center.metrics.health).await;

    let status = if report.overall_healthy {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    };

    let components = report
        .components
        .into_iter()
        .map(|(name, health)| {
            (
                name,
                ApiComponentHealth {
                    status: if health.healthy { HealthStatus::Healthy } else { HealthStatus::Unhealthy },
                    message: health.error,
                    latency_ms: Some(health.latency.as_millis() as u64),
                },
            )
        })
        .collect();

    let body = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_owned(),
        components,
    };

    // Per-component detail lives in the body; the status is always 200.
    (StatusCode::OK, Json(body))
}

//----------- /add-record, /list-records, /remove-record ----------------------------

async fn add_record(State(center): State<Arc<Center>>, Json(request): Json<AddRecordRequest>) -> Response {
    let internal_request = CreateRecordRequest {
        service: request.service_name,
        name: request.name,
        port: request.port,
        target_device: request.target_device,
    };

    match center
        .records
        .create_record(internal_request, &center.metrics.zone, &center.metrics.resolver, &center.metrics.proxy)
        .await
    {
        Ok(entry) => {
            let _ = center.updates.send(Update::RecordCreated {
                fqdn: entry.fqdn.clone(),
                proxied: entry.proxied,
            });
            let rules = center.proxy.list_rules().await;
            (StatusCode::CREATED, Json(to_api_record(&entry, &rules))).into_response()
        }
        Err(err) => create_record_error_response(err),
    }
}

async fn list_records(State(center): State<Arc<Center>>) -> impl IntoResponse {
    let entries = center.records.list_records().await;
    let rules = center.proxy.list_rules().await;
    let records: Vec<Record> = entries.iter().map(|entry| to_api_record(entry, &rules)).collect();
    Json(records)
}

async fn remove_record(State(center): State<Arc<Center>>, Json(request): Json<RemoveRecordRequest>) -> Response {
    match center
        .records
        .remove_record(
            &request.service_name,
            &request.name,
            &center.metrics.zone,
            &center.metrics.resolver,
            &center.metrics.proxy,
        )
        .await
    {
        Ok(()) => {
            let fqdn = format!("{}.{}", request.name, center.config.base_domain);
            let _ = center.updates.send(Update::RecordRemoved { fqdn });
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => remove_record_error_response(err),
    }
}

fn to_api_record(entry: &RecordEntry, rules: &[ProxyRule]) -> Record {
    let proxy_rule = entry.proxied.then(|| rules.iter().find(|rule| rule.hostname_fqdn == entry.fqdn)).flatten().map(|rule| {
        ProxyRuleView {
            hostname: rule.hostname_fqdn.clone(),
            target_ip: rule.target_address,
            target_port: rule.target_port,
            scheme: match rule.scheme {
                Scheme::Http => ApiScheme::Http,
                Scheme::Https => ApiScheme::Https,
            },
        }
    });

    Record {
        name: entry.fqdn.clone(),
        record_type: RecordType::A,
        ip: entry.address,
        proxy_rule,
    }
}

fn create_record_error_response(err: RecordError) -> Response {
    let api_err = match &err {
        RecordError::InvalidInput(msg) => CreateRecordError::InvalidInput(msg.clone()),
        RecordError::Conflict(msg) => CreateRecordError::Conflict(msg.clone()),
        RecordError::TargetUnresolvable(msg) => CreateRecordError::NotFound(msg.clone()),
        RecordError::Zone(msg) | RecordError::Resolver(msg) | RecordError::Storage(msg) => {
            CreateRecordError::UpstreamUnavailable(msg.clone())
        }
    };
    let status = match &api_err {
        CreateRecordError::InvalidInput(_) | CreateRecordError::NotFound(_) | CreateRecordError::Conflict(_) => {
            StatusCode::BAD_REQUEST
        }
        CreateRecordError::UpstreamUnavailable(_) | CreateRecordError::IoError(_) => {
            tracing::error!(error = %err, "add-record failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(api_err)).into_response()
}

fn remove_record_error_response(err: RecordError) -> Response {
    let api_err = match &err {
        RecordError::InvalidInput(msg) => RemoveRecordError::InvalidInput(msg.clone()),
        other => {
            tracing::error!(error = %other, "remove-record failed");
            RemoveRecordError::IoError(other.to_string())
        }
    };
    let status = match &api_err {
        RemoveRecordError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        RemoveRecordError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(api_err)).into_response()
}

//----------- /list-devices, /annotate-device, /device-storage-info -----------------

async fn list_devices(State(center): State<Arc<Center>>) -> Response {
    match center.inventory.list_devices().await {
        Ok(devices) => {
            let devices = devices
                .into_iter()
                .map(|device| DeviceView {
                    id: device.id,
                    overlay_name: device.overlay_name,
                    dns_name: device.annotations.as_ref().and_then(|a| a.dns_name.clone()),
                    description: device.annotations.as_ref().and_then(|a| a.description.clone()),
                    addresses: device.addresses,
                    online: device.online,
                })
                .collect();
            (StatusCode::OK, Json(ListDevicesResult { devices })).into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "list-devices failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn annotate_device(State(center): State<Arc<Center>>, Json(request): Json<AnnotateDeviceRequest>) -> Response {
    match center.inventory.annotate(&request.id, request.dns_name, request.description).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(InventoryError::NotFound(id)) => {
            (StatusCode::NOT_FOUND, Json(AnnotateDeviceError::NotFound(id))).into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "annotate-device failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(AnnotateDeviceError::IoError(err.to_string()))).into_response()
        }
    }
}

async fn device_storage_info(State(center): State<Arc<Center>>) -> impl IntoResponse {
    let info = center.inventory.storage_info().await;
    Json(DeviceStorageInfo {
        path: info.path,
        exists: info.exists,
        backups: info.backups,
    })
}

//----------- /metrics ---------------------------------------------------------------

async fn metrics(State(center): State<Arc<Center>>) -> Response {
    match center.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "metrics rendering failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

