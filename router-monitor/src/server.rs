use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::arp::ArpTableReader;
use crate::dnsmasq::DnsmasqCollector;
use crate::error::ScrapeError;
use crate::flows::{FlowCounterReader, FlowMetrics};

pub const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Everything a scrape has to refresh before the registry is encoded.
pub struct Exporter {
    flows: FlowCounterReader,
    flow_metrics: FlowMetrics,
    arp: ArpTableReader,
    dnsmasq: DnsmasqCollector,
}

impl Exporter {
    pub fn new(flows: FlowCounterReader, arp: ArpTableReader, dnsmasq: DnsmasqCollector) -> Self {
        Self {
            flows,
            flow_metrics: FlowMetrics::default(),
            arp,
            dnsmasq,
        }
    }

    pub fn register(&self, registry: &mut Registry) {
        self.flow_metrics.register(registry);
        self.arp.register(registry);
        self.dnsmasq.register(registry);
    }

    pub async fn scrape(&self) -> Result<(), ScrapeError> {
        let samples = self.flows.collect().map_err(ScrapeError::FlowTable)?;
        let flow_count = samples.len();
        self.flow_metrics.replace(samples);

        let arp_count = self.arp.collect().await;
        self.dnsmasq.collect().await?;

        debug!(flows = flow_count, arp_entries = arp_count, "scrape collected");
        Ok(())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub exporter: Arc<Exporter>,
    /// Cancelled when the flow tables stop being readable.
    pub fatal: CancellationToken,
    pub metrics_path: String,
}

pub fn router(state: AppState) -> Router {
    let metrics_path = state.metrics_path.clone();
    let mut app = Router::new().route(&metrics_path, get(metrics));
    if metrics_path != "/" {
        app = app.route("/", get(index));
    }
    app.with_state(state)
}

pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    let local = listener.local_addr().context("listener has no local address")?;
    info!(addr = %local, "serving metrics");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server failed")
}

async fn index(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html><head><title>router-monitor</title></head><body>\
         <h1>router-monitor</h1><p><a href=\"{}\">Metrics</a></p></body></html>",
        state.metrics_path
    ))
}

async fn metrics(State(state): State<AppState>) -> Result<Response, ScrapeError> {
    if let Err(err) = state.exporter.scrape().await {
        if let ScrapeError::FlowTable(_) = err {
            error!(error = %err, "flow tables unreadable, shutting down");
            state.fatal.cancel();
        }
        return Err(err);
    }

    let mut body = String::new();
    encode(&mut body, &state.registry)?;
    Ok(([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body).into_response())
}
