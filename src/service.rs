//! Ingestion and diagnosis request boundary, independent of transport.

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::analysis::{DiagnosisEngine, DiagnosisReport};
use crate::api::health::HealthMetrics;
use crate::store::{FrameStore, StoreError, StoreKey};
use crate::telemetry::frame::Frame;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no telemetry data found for scenario: {scenario_id}")]
    NotFound { scenario_id: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One ingested frame, optionally tagged with the scenario it belongs to.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    #[serde(flatten)]
    pub frame: Frame,
    #[serde(default, alias = "scenarioId")]
    pub scenario_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiagnoseRequest {
    #[serde(alias = "scenarioId")]
    pub scenario_id: String,
}

/// Stores ingested frames and diagnoses scenarios on demand.
pub struct TelemetryService {
    store: Arc<dyn FrameStore>,
    engine: DiagnosisEngine,
    metrics: Option<Arc<HealthMetrics>>,
}

impl TelemetryService {
    pub fn new(store: Arc<dyn FrameStore>, engine: DiagnosisEngine) -> Self {
        Self {
            store,
            engine,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Appends the frame to the user's raw stream and, when tagged, to the
    /// scenario index. A client may retry a failed ingest; keys that already
    /// hold the frame as their tail do not store it again.
    pub fn ingest(&self, user: &str, req: &IngestRequest) -> Result<(), ServiceError> {
        self.store.append(&StoreKey::stream(user), &req.frame)?;

        if let Some(scenario) = req.scenario_id.as_deref().filter(|s| !s.is_empty()) {
            self.store
                .append(&StoreKey::scenario(user, scenario), &req.frame)?;
        }

        if let Some(m) = &self.metrics {
            m.frames_ingested.inc();
        }
        Ok(())
    }

    /// Diagnoses every frame recorded under `scenario_id`. A scenario without
    /// frames is an error, not an empty report.
    pub fn diagnose(&self, user: &str, scenario_id: &str) -> Result<DiagnosisReport, ServiceError> {
        let result = self.diagnose_inner(user, scenario_id);
        if let Some(m) = &self.metrics {
            let outcome = match &result {
                Ok(_) => "ok",
                Err(ServiceError::NotFound { .. }) => "not_found",
                Err(_) => "error",
            };
            m.diagnoses.with_label_values(&[outcome]).inc();
        }
        result
    }

    fn diagnose_inner(&self, user: &str, scenario_id: &str) -> Result<DiagnosisReport, ServiceError> {
        let frames = self.store.range(&StoreKey::scenario(user, scenario_id))?;
        if frames.is_empty() {
            return Err(ServiceError::NotFound {
                scenario_id: scenario_id.to_string(),
            });
        }

        let _timer = self
            .metrics
            .as_ref()
            .map(|m| m.analysis_duration.start_timer());
        let report = self.engine.diagnose(scenario_id, &frames);

        tracing::info!(
            user,
            scenario_id,
            frames = frames.len(),
            score = report.score,
            alerts = report.alerts.len(),
            "diagnosis complete",
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalysisConfig, TopologyConfig};
    use crate::store::{MemoryStore, Retention};
    use crate::telemetry::metric::Metric;

    fn service() -> (TelemetryService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(Retention::default()));
        let engine = DiagnosisEngine::new(&AnalysisConfig::default(), &TopologyConfig::default());
        let metrics = Arc::new(HealthMetrics::new().expect("metrics"));
        let svc = TelemetryService::new(store.clone(), engine).with_metrics(metrics);
        (svc, store)
    }

    fn request(ts: i64, scenario: Option<&str>) -> IngestRequest {
        IngestRequest {
            frame: Frame::new(ts, 100).with_weight("hero", Metric::from_value(1.0)),
            scenario_id: scenario.map(String::from),
        }
    }

    #[test]
    fn test_ingest_indexes_scenario() {
        let (svc, store) = service();
        svc.ingest("u1", &request(1, Some("s1"))).expect("ingest");
        svc.ingest("u1", &request(2, None)).expect("ingest");
        svc.ingest("u1", &request(3, Some(""))).expect("ingest");

        assert_eq!(store.range(&StoreKey::stream("u1")).expect("range").len(), 3);
        let scenario = store.range(&StoreKey::scenario("u1", "s1")).expect("range");
        assert_eq!(scenario.len(), 1);
        assert_eq!(scenario[0].timestamp, 1);
    }

    /// Rejects scenario appends while `down` is set.
    struct ScenarioOutage {
        inner: MemoryStore,
        down: std::sync::atomic::AtomicBool,
    }

    impl FrameStore for ScenarioOutage {
        fn append(&self, key: &StoreKey, frame: &Frame) -> Result<(), StoreError> {
            if matches!(key, StoreKey::Scenario { .. })
                && self.down.load(std::sync::atomic::Ordering::SeqCst)
            {
                return Err(StoreError::Unavailable("scenario index offline".to_string()));
            }
            self.inner.append(key, frame)
        }

        fn range(&self, key: &StoreKey) -> Result<Vec<Frame>, StoreError> {
            self.inner.range(key)
        }
    }

    #[test]
    fn test_retried_ingest_does_not_duplicate_stream() {
        let store = Arc::new(ScenarioOutage {
            inner: MemoryStore::default(),
            down: std::sync::atomic::AtomicBool::new(true),
        });
        let engine = DiagnosisEngine::new(&AnalysisConfig::default(), &TopologyConfig::default());
        let svc = TelemetryService::new(store.clone(), engine);

        let req = request(1, Some("s1"));
        assert!(matches!(
            svc.ingest("u1", &req),
            Err(ServiceError::Store(StoreError::Unavailable(_)))
        ));
        store.down.store(false, std::sync::atomic::Ordering::SeqCst);
        svc.ingest("u1", &req).expect("retry");

        assert_eq!(store.range(&StoreKey::stream("u1")).expect("range").len(), 1);
        assert_eq!(
            store
                .range(&StoreKey::scenario("u1", "s1"))
                .expect("range")
                .len(),
            1
        );
    }

    #[test]
    fn test_diagnose_unknown_scenario_is_not_found() {
        let (svc, _) = service();
        let err = svc.diagnose("u1", "missing").unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { ref scenario_id } if scenario_id == "missing"));
        assert_eq!(err.to_string(), "no telemetry data found for scenario: missing");
    }

    #[test]
    fn test_scenarios_are_per_user() {
        let (svc, _) = service();
        svc.ingest("u1", &request(1, Some("s1"))).expect("ingest");
        assert!(svc.diagnose("u1", "s1").is_ok());
        assert!(matches!(
            svc.diagnose("u2", "s1"),
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[test]
    fn test_ingest_request_json() {
        let json = r#"{"ts":5,"dur":100,"scenario_id":"s9","extra":true,
            "data":{"hero":{"w":{"o":1,"h":1,"l":1,"c":1,"cnt":1}}}}"#;
        let req: IngestRequest = serde_json::from_str(json).expect("decode ingest");
        assert_eq!(req.scenario_id.as_deref(), Some("s9"));
        assert_eq!(req.frame.timestamp, 5);
        assert!(req.frame.entity("hero").is_some());

        let missing_data = r#"{"ts":5}"#;
        assert!(serde_json::from_str::<IngestRequest>(missing_data).is_err());
    }
}
