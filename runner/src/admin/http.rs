//! Ops-only admin surface: `GET /health`, `GET /metrics`. No strategy,
//! position, or order endpoints live here — this is observability, not the
//! user-facing CRUD spec.md places out of scope.

use actix_web::{get, web, App, HttpResponse, HttpServer, Scope};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::admin::metrics::Metrics;

#[get("")]
async fn health_check() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

pub fn health_scope() -> Scope {
    web::scope("/health").service(health_check)
}

#[get("")]
async fn render_metrics(handle: web::Data<PrometheusHandle>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(handle.render())
}

pub fn metrics_scope() -> Scope {
    web::scope("/metrics").service(render_metrics)
}

/// Binds the admin HTTP server on `port` and runs until the process exits.
pub async fn run_admin_server(port: u16, prometheus: PrometheusHandle) -> std::io::Result<()> {
    HttpServer::new(move || {
        App::new()
            .wrap(Metrics)
            .app_data(web::Data::new(prometheus.clone()))
            .service(health_scope())
            .service(metrics_scope())
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
