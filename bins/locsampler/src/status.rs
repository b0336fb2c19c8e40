#![cfg(feature = "web-api")]

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::info;

use crate::module::{Module, ModuleCtx};
use crate::scheduler::{JobView, Scheduler};
use loc_core::store::DefaultKv;

#[derive(Clone)]
struct AppState {
    scheduler: Scheduler<DefaultKv>,
    started: Instant,
}

#[derive(Serialize)]
struct Status {
    uptime_ms: u64,
    jobs: Vec<JobView>,
}

pub struct StatusServer {
    addr: SocketAddr,
}

impl StatusServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Module for StatusServer {
    fn name(&self) -> &'static str {
        "status"
    }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let app = router(ctx.scheduler.clone());
            let listener = tokio::net::TcpListener::bind(self.addr).await?;
            info!("status server listening on http://{}", self.addr);

            let mut shutdown = ctx.shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while shutdown.changed().await.is_ok() {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                })
                .await?;

            Ok(())
        })
    }
}

fn router(scheduler: Scheduler<DefaultKv>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/jobs/:name", delete(cancel_job))
        .route("/fixes/:name", get(last_fix))
        .with_state(AppState { scheduler, started: Instant::now() })
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let uptime_ms = state.started.elapsed().as_millis() as u64;
    Json(Status { uptime_ms, jobs: state.scheduler.registrations() })
}

async fn last_fix(Path(name): Path<String>, State(state): State<AppState>) -> impl IntoResponse {
    let store = state.scheduler.store();
    match (store.last_fix(&name), store.fix_count(&name)) {
        (Ok(Some(fix)), Ok(count)) => {
            Json(json!({ "job": name, "fix": fix, "count": count })).into_response()
        }
        (Ok(None), _) => (StatusCode::NOT_FOUND, "no fix").into_response(),
        (Err(e), _) | (_, Err(e)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn cancel_job(Path(name): Path<String>, State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.cancel(&name) {
        Ok(removed) => Json(json!({ "job": name, "removed": removed })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde_json::Value;
    use tokio::sync::watch;
    use tower::ServiceExt;

    use crate::constraints::StaticProbe;
    use crate::location::ProviderSource;
    use crate::permission::StaticGate;
    use crate::provider::SimulatedProvider;
    use crate::runner::Runner;
    use crate::sink::KvFixSink;
    use loc_core::job::{Action, BackoffPolicy, ExistingPolicy, JobSpec, LocationFix};
    use loc_core::store::{open_fs, JobStore};

    fn scheduler(dir: &std::path::Path) -> (Scheduler<DefaultKv>, watch::Sender<bool>) {
        let fix =
            LocationFix { latitude: 52.52, longitude: 13.405, accuracy_m: 8.0, timestamp_ms: 0 };
        let provider = Arc::new(SimulatedProvider::new(fix, Some(Duration::from_secs(1))));
        let store = JobStore::new(open_fs(dir).unwrap());
        let runner = Arc::new(Runner::new(
            Arc::new(ProviderSource::new(provider, Duration::from_secs(600))),
            Arc::new(StaticGate::new(true, true)),
            Arc::new(KvFixSink::new(store.clone())),
        ));
        let (tx, rx) = watch::channel(false);
        let probe = Arc::new(StaticProbe::new(false, true));
        (Scheduler::new(runner, probe, BackoffPolicy::default(), store, rx), tx)
    }

    async fn call(app: &Router, method: Method, uri: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        (status, to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec())
    }

    fn json(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn routes_report_fixes_and_cancel_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let (sched, _shutdown) = scheduler(tmp.path());
        let app = router(sched.clone());

        let (code, body) = call(&app, Method::GET, "/fixes/LocationWork").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(body, b"no fix");

        let action =
            Action::SampleLocation { deadline_ms: 20_000, high_accuracy: true, background: true };
        let spec = JobSpec::periodic("LocationWork", Duration::from_secs(3600), action);
        sched.enqueue_periodic(spec, ExistingPolicy::Keep).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let (code, body) = call(&app, Method::GET, "/status").await;
        assert_eq!(code, StatusCode::OK);
        let status = json(&body);
        assert_eq!(status["jobs"][0]["spec"]["name"], "LocationWork");
        assert_eq!(status["jobs"][0]["state"]["runs"], 1);

        let (code, body) = call(&app, Method::GET, "/fixes/LocationWork").await;
        assert_eq!(code, StatusCode::OK);
        let fix = json(&body);
        assert_eq!(fix["count"], 1);
        assert_eq!(fix["fix"]["latitude"], 52.52);

        let (code, body) = call(&app, Method::DELETE, "/jobs/LocationWork").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(json(&body)["removed"], true);

        let (_, body) = call(&app, Method::GET, "/status").await;
        assert!(json(&body)["jobs"].as_array().unwrap().is_empty());
        let (_, body) = call(&app, Method::DELETE, "/jobs/LocationWork").await;
        assert_eq!(json(&body)["removed"], false);
    }
}
