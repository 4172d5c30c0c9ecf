use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use clap::ValueEnum;
use opentelemetry::global;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt as tracing_fmt};

/// Target of the lifecycle events written to the JSON event log.
pub const EVENT_TARGET: &str = "lifecycle";

const SERVICE_NAME: &str = "helm";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// Keeps the exporters alive; flush with [`TelemetryGuard::shutdown`] before exit.
pub enum TelemetryGuard {
    Otel(Telemetry),
    Files(FileTelemetry),
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let TelemetryGuard::Otel(telemetry) = self {
            telemetry.shutdown();
        }
    }
}

/// Installs the global subscriber: OTLP exporters when an endpoint is given, rolling
/// files under `log_dir` otherwise.
pub fn init_tracing(log_dir: &Path, log_level: LogLevel, otel_endpoint: Option<&str>) -> Result<TelemetryGuard> {
    let guard = match otel_endpoint {
        Some(endpoint) => TelemetryGuard::Otel(Telemetry::init(log_level, endpoint)?),
        None => TelemetryGuard::Files(FileTelemetry::init_files(
            log_level,
            log_dir.join("helm.log"),
            log_dir.join("events.json"),
        )?),
    };
    info!(level = %log_level, "tracing initialised");
    Ok(guard)
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn signal_endpoint(base: &str, signal: &str) -> String {
    format!("{}/v1/{}", base.trim_end_matches('/'), signal)
}

fn init_logs(endpoint: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(signal_endpoint(endpoint, "logs"))
        .build()
        .context("log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_traces(endpoint: &str) -> Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(signal_endpoint(endpoint, "traces"))
        .build()
        .context("span exporter")?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(endpoint: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(signal_endpoint(endpoint, "metrics"))
        .build()
        .context("metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

/// OTLP/HTTP logs, traces and metrics. Connector executor gauges reach the collector
/// through the global meter provider installed here.
pub struct Telemetry {
    logger_provider: SdkLoggerProvider,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn init(log_level: LogLevel, endpoint: &str) -> Result<Self> {
        // 1) bring up the three SDKs
        let logger_provider = init_logs(endpoint)?;
        let tracer_provider = init_traces(endpoint)?;
        let meter_provider = init_metrics(endpoint)?;

        // 2) bridge tracing events to OTel logs, without the exporter's own chatter
        let level = log_level.to_string();
        let otel_filter = EnvFilter::new(&level)
            .add_directive("hyper=off".parse()?)
            .add_directive("tonic=off".parse()?)
            .add_directive("h2=off".parse()?)
            .add_directive("reqwest=off".parse()?);
        let otel_logs_layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(otel_filter);

        // 3) keep a local printer on stdout
        let fmt_layer = tracing_fmt::layer()
            .with_thread_names(true)
            .with_filter(EnvFilter::new(&level));

        // 4) install subscriber
        Registry::default()
            .with(otel_logs_layer)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| anyhow!("tracing subscriber already installed: {e}"))?;

        // 5) register tracer and meter globally
        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        Ok(Telemetry {
            logger_provider,
            tracer_provider,
            meter_provider,
        })
    }

    pub fn shutdown(self) {
        if let Err(e) = self.meter_provider.shutdown() {
            warn!("meter provider shutdown: {e}");
        }
        if let Err(e) = self.tracer_provider.shutdown() {
            warn!("tracer provider shutdown: {e}");
        }
        if let Err(e) = self.logger_provider.shutdown() {
            warn!("logger provider shutdown: {e}");
        }
    }
}

/// Rolling text log plus a newline-delimited JSON log of lifecycle events.
pub struct FileTelemetry {
    pub log_file: PathBuf,
    pub event_file: PathBuf,
}

fn rolling(path: &Path) -> Result<RollingFileAppender> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("creating log directory {}", dir.display()))?;
    let file = path
        .file_name()
        .ok_or_else(|| anyhow!("{} is not a file path", path.display()))?;
    Ok(RollingFileAppender::new(Rotation::DAILY, dir, file))
}

impl FileTelemetry {
    pub fn init_files(log_level: LogLevel, log_file: PathBuf, event_file: PathBuf) -> Result<Self> {
        // 1) plain text for everything at `log_level`
        let txt_layer = tracing_fmt::layer()
            .with_writer(rolling(&log_file)?)
            .with_ansi(false)
            .with_filter(EnvFilter::new(log_level.to_string()));

        // 2) JSON for lifecycle events only
        let json_layer = tracing_fmt::layer()
            .json()
            .with_writer(rolling(&event_file)?)
            .with_target(true)
            .with_filter(EnvFilter::new(format!("{EVENT_TARGET}=info")));

        // 3) install subscriber
        Registry::default()
            .with(txt_layer)
            .with(json_layer)
            .try_init()
            .map_err(|e| anyhow!("tracing subscriber already installed: {e}"))?;

        Ok(FileTelemetry { log_file, event_file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_endpoint() {
        assert_eq!(signal_endpoint("http://collector:4318/", "logs"), "http://collector:4318/v1/logs");
        assert_eq!(signal_endpoint("http://collector:4318", "metrics"), "http://collector:4318/v1/metrics");
    }

    #[test]
    fn test_log_level_directive() {
        assert_eq!(LogLevel::default().to_string(), "info");
        assert_eq!(LogLevel::from_str("warn", true).unwrap(), LogLevel::Warn);
    }

    #[test]
    fn test_rolling_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("helm.log");
        rolling(&path).unwrap();
        assert!(dir.path().join("nested").is_dir());
    }
}
