// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OTLP-style export endpoint.
//!
//! The handler does exactly four things before returning: size the
//! serialized request, lease a buffer that big, marshal into it, and
//! hand the lease to the reflex. Backpressure never surfaces here - a
//! full queue becomes a counted spill inside the ingester, and the
//! caller still gets an empty success response.

use std::sync::Arc;

use prost::Message;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::error;

use gship_proto::logs::v1::logs_service_server::LogsService;
use gship_proto::logs::v1::{ExportLogsRequest, ExportLogsResponse};

use crate::status::EngineDeps;

/// gRPC surface delegating to the core ingester.
#[derive(Clone)]
pub struct LogsIngestService {
    deps: Arc<EngineDeps>,
    token: CancellationToken,
}

impl LogsIngestService {
    pub fn new(deps: Arc<EngineDeps>, token: CancellationToken) -> Self {
        LogsIngestService { deps, token }
    }
}

#[tonic::async_trait]
impl LogsService for LogsIngestService {
    async fn export(
        &self,
        request: Request<ExportLogsRequest>,
    ) -> Result<Response<ExportLogsResponse>, Status> {
        let message = request.into_inner();
        let size = message.encoded_len();

        let mut lease = self.deps.pool.acquire(size);
        if let Err(err) = message.encode(lease.vec_mut()) {
            error!(error = %err, "failed to marshal export request");
            return Err(Status::internal("failed to marshal export request"));
        }

        self.deps.monitor.report_ingester_usage(size as i64);
        self.deps.ingester.ingest(lease, &self.token);

        Ok(Response::new(ExportLogsResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gship::buffer::BufferPool;
    use gship::ingest::Ingester;
    use gship::metrics::EngineMetrics;
    use gship::pressure::{Monitor, MonitorConfig, PressureSource, PressureState};
    use gship_proto::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};
    use std::time::Instant;

    fn deps_with_queue(capacity: usize) -> Arc<EngineDeps> {
        let metrics = Arc::new(EngineMetrics::new());
        let state = PressureState::new(Arc::clone(&metrics));
        let monitor = Monitor::new(
            MonitorConfig::default(),
            Arc::clone(&state),
            Arc::clone(&metrics),
        );
        let pool = BufferPool::new();
        let ingester = Ingester::new(
            capacity,
            Arc::clone(&pool),
            Arc::clone(&monitor),
            Arc::clone(&metrics),
        );
        Arc::new(EngineDeps {
            state,
            monitor,
            pool,
            metrics,
            ingester,
            start_time: Instant::now(),
        })
    }

    fn sample_request(body: &str) -> ExportLogsRequest {
        ExportLogsRequest {
            resource_logs: vec![ResourceLogs {
                resource: None,
                scope_logs: vec![ScopeLogs {
                    scope_name: "test".into(),
                    log_records: vec![LogRecord {
                        time_unix_nano: 1,
                        observed_time_unix_nano: 2,
                        severity_number: 9,
                        severity_text: "INFO".into(),
                        body: body.into(),
                        attributes: vec![],
                    }],
                }],
            }],
        }
    }

    #[tokio::test]
    async fn export_enqueues_and_reports_usage() {
        let deps = deps_with_queue(8);
        let svc = LogsIngestService::new(Arc::clone(&deps), CancellationToken::new());

        let response = svc
            .export(Request::new(sample_request("hello")))
            .await
            .expect("export");
        let _ = response.into_inner();

        assert_eq!(deps.ingester.queue_depth(), 1);
        assert!(deps.monitor.ingester_usage() > 0);
        assert_eq!(deps.ingester.spilled_count(), 0);
    }

    #[tokio::test]
    async fn saturation_spills_second_export() {
        // Queue capacity 1 and no drain worker: the second export must
        // take the fallback, count one spill, and still succeed.
        let deps = deps_with_queue(1);
        let svc = LogsIngestService::new(Arc::clone(&deps), CancellationToken::new());

        svc.export(Request::new(sample_request("first")))
            .await
            .expect("first export");
        svc.export(Request::new(sample_request("second")))
            .await
            .expect("second export");

        assert_eq!(deps.ingester.spilled_count(), 1);
        assert_eq!(deps.metrics.spills_total(), 1);
        // Spilled lease released; only the queued one remains live.
        assert_eq!(deps.pool.live_leases(), 1);
    }
}
