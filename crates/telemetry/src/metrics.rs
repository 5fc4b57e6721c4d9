use lazy_static::lazy_static;
use prometheus::{
    Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ==== Frame Processing ====
    pub static ref LPR_FRAMES_PROCESSED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "lpr_frames_processed_total",
                "Total number of frames handled by the recognition pipeline",
            ),
            &["camera_id", "outcome"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LPR_FRAMES_SKIPPED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "lpr_frames_skipped_total",
                "Frames dropped because the previous frame finished too recently",
            ),
            &["camera_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LPR_FRAME_LATENCY: HistogramVec = {
        let metric = HistogramVec::new(
            HistogramOpts::new(
                "lpr_frame_processing_seconds",
                "Wall time spent recognizing plates in one frame",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            &["camera_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LPR_CANDIDATE_REGIONS: IntCounter = {
        let metric = IntCounter::new(
            "lpr_candidate_regions_total",
            "Candidate plate regions returned by the detector",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== OCR ====
    pub static ref LPR_OCR_ENGINE_CALLS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "lpr_ocr_engine_calls_total",
                "OCR engine invocations by engine and status",
            ),
            &["engine", "status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LPR_OCR_INFERENCE_TIME: HistogramVec = {
        let metric = HistogramVec::new(
            HistogramOpts::new(
                "lpr_ocr_inference_seconds",
                "Time spent inside a single OCR engine call",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0]),
            &["engine", "execution_provider"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LPR_CACHE_REQUESTS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "lpr_cache_requests_total",
                "Result cache lookups by result (hit, miss, error)",
            ),
            &["result"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LPR_CACHE_HEALTH: IntGauge = {
        let metric = IntGauge::new(
            "lpr_cache_healthy",
            "Result cache health (1=healthy, 0=degraded or error)",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Decisions ====
    pub static ref LPR_DECISIONS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("lpr_decisions_total", "Decisions taken on scored detections"),
            &["decision"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LPR_REJECTIONS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "lpr_rejections_total",
                "Per-detection failures recovered inside the pipeline",
            ),
            &["reason"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Tracking ====
    pub static ref LPR_ACTIVE_TRACKS: IntGauge = {
        let metric = IntGauge::new("lpr_active_tracks", "Plates currently tracked")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LPR_CORRELATIONS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "lpr_cross_camera_correlations_total",
                "Cross-camera plate correlations",
            ),
            &["confirmed"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Camera Sync ====
    pub static ref LPR_SYNC_OFFSET: Gauge = {
        let metric = Gauge::new(
            "lpr_clock_offset_seconds",
            "Offset between the time servers and the local clock",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LPR_SYNC_FAILURES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "lpr_time_server_failures_total",
                "Failed time server queries",
            ),
            &["server"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LPR_BUFFERED_FRAMES: IntGaugeVec = {
        let metric = IntGaugeVec::new(
            Opts::new(
                "lpr_buffered_frames",
                "Frames held in the synchronization buffer per camera",
            ),
            &["camera_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Render all registered metrics in the Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_metrics_accessible() {
        LPR_FRAMES_PROCESSED
            .with_label_values(&["cam-test", "recognized"])
            .inc();
        assert!(
            LPR_FRAMES_PROCESSED
                .with_label_values(&["cam-test", "recognized"])
                .get()
                >= 1
        );

        LPR_FRAMES_SKIPPED.with_label_values(&["cam-test"]).inc();
        assert!(LPR_FRAMES_SKIPPED.with_label_values(&["cam-test"]).get() >= 1);
    }

    #[test]
    fn test_tracking_metrics_accessible() {
        LPR_ACTIVE_TRACKS.set(4);
        assert_eq!(LPR_ACTIVE_TRACKS.get(), 4);

        LPR_SYNC_OFFSET.set(0.25);
        assert_eq!(LPR_SYNC_OFFSET.get(), 0.25);
    }

    #[test]
    fn test_encode_metrics() {
        LPR_CACHE_REQUESTS.with_label_values(&["hit"]).inc();
        let text = encode_metrics().unwrap();
        assert!(text.contains("lpr_cache_requests_total"));
    }
}
