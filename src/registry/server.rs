use super::store::{RegistryError, ServiceRecord, ServiceRegistry, periodic_persist};
use crate::config::RegistryConfig;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, HttpServer, ResponseError, get, post, web};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

impl ResponseError for RegistryError {
    fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Persist { .. } | RegistryError::Load { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "success": false,
            "error": self.to_string(),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct RegistryState {
    pub registry: Arc<ServiceRegistry>,
    pub client: reqwest::Client,
}

impl RegistryState {
    pub fn new(registry: Arc<ServiceRegistry>, health_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(health_timeout).build()?;
        Ok(Self { registry, client })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    pub service_name: Option<String>,
    pub url: Option<String>,
    pub health: Option<String>,
    pub metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterBody {
    pub service_name: Option<String>,
}

#[post("/register")]
pub async fn register(
    body: web::Json<RegisterBody>,
    state: web::Data<RegistryState>,
) -> Result<HttpResponse, RegistryError> {
    let body = body.into_inner();
    let record = state
        .registry
        .register(body.service_name, body.url, body.health, body.metadata)
        .await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "service": record,
    })))
}

#[post("/unregister")]
pub async fn unregister(
    body: web::Json<UnregisterBody>,
    state: web::Data<RegistryState>,
) -> Result<HttpResponse, RegistryError> {
    let name = body
        .into_inner()
        .service_name
        .ok_or_else(|| RegistryError::BadRequest("serviceName is required".to_string()))?;
    state.registry.unregister(&name).await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true })))
}

#[get("/service/{name}")]
pub async fn get_service(
    name: web::Path<String>,
    state: web::Data<RegistryState>,
) -> Result<HttpResponse, RegistryError> {
    let record = state.registry.get(&name)?;
    Ok(HttpResponse::Ok().json(record))
}

#[get("/services")]
pub async fn list_services(state: web::Data<RegistryState>) -> HttpResponse {
    HttpResponse::Ok().json(state.registry.list())
}

async fn probe(client: &reqwest::Client, record: &ServiceRecord) -> serde_json::Value {
    match client.get(record.health_url()).send().await {
        Ok(resp) => json!({
            "healthy": resp.status().is_success(),
            "status": resp.status().as_u16(),
        }),
        Err(e) => {
            log::debug!("Health probe for {} failed: {}", record.name, e);
            json!({ "healthy": false, "status": null })
        }
    }
}

#[get("/services/health")]
pub async fn services_health(state: web::Data<RegistryState>) -> HttpResponse {
    let services = state.registry.list();
    let probes = services.values().map(|record| probe(&state.client, record));
    let results = join_all(probes).await;
    let report: serde_json::Map<String, serde_json::Value> =
        services.into_keys().zip(results).collect();
    HttpResponse::Ok().json(report)
}

#[get("/health")]
pub async fn health(state: web::Data<RegistryState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": "service-registry",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "services": state.registry.len(),
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig, state: web::Data<RegistryState>) {
    cfg.app_data(state)
        .app_data(web::JsonConfig::default().error_handler(|err, _req| {
            RegistryError::BadRequest(format!("Invalid JSON payload: {}", err)).into()
        }))
        .service(register)
        .service(unregister)
        .service(services_health)
        .service(list_services)
        .service(get_service)
        .service(health);
}

pub async fn startup(config: RegistryConfig) -> anyhow::Result<()> {
    let registry = Arc::new(ServiceRegistry::load(&config.state_file).await?);
    let state = web::Data::new(RegistryState::new(
        registry.clone(),
        Duration::from_secs(config.health_timeout_secs),
    )?);

    let persister = actix_web::rt::spawn(periodic_persist(
        registry.clone(),
        Duration::from_secs(config.persist_interval_secs),
    ));

    log::info!(
        "Starting service registry at {}:{} (state file {})",
        config.host,
        config.port,
        config.state_file.display()
    );

    let result = HttpServer::new(move || {
        actix_web::App::new()
            .wrap(actix_web::middleware::Logger::default())
            .configure(|cfg| configure(cfg, state.clone()))
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await;

    persister.abort();
    registry.persist().await?;
    log::info!(
        "Service registry stopped, {} services flushed to {}",
        registry.len(),
        registry.path().display()
    );
    Ok(result?)
}
