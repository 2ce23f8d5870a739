//! Prometheus text rendering.
//!
//! Each daemon keeps its counters in atomics and renders them on demand from
//! its `/metrics` handler; there is no global recorder so tests can construct
//! isolated instances.

use std::fmt::Write as _;

/// Content type for the Prometheus text exposition format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Incremental builder for a metrics page.
#[derive(Debug, Default)]
pub struct PrometheusText {
    buf: String,
}

impl PrometheusText {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&mut self, name: &str, help: &str, value: u64) -> &mut Self {
        let _ = writeln!(self.buf, "# HELP {name} {help}");
        let _ = writeln!(self.buf, "# TYPE {name} counter");
        let _ = writeln!(self.buf, "{name} {value}");
        self
    }

    pub fn gauge(&mut self, name: &str, help: &str, value: f64) -> &mut Self {
        let _ = writeln!(self.buf, "# HELP {name} {help}");
        let _ = writeln!(self.buf, "# TYPE {name} gauge");
        let _ = writeln!(self.buf, "{name} {value}");
        self
    }

    /// A gauge with label pairs, e.g. per-slice or per-interface samples.
    pub fn labeled_gauge(
        &mut self,
        name: &str,
        help: &str,
        series: &[(Vec<(String, String)>, f64)],
    ) -> &mut Self {
        let _ = writeln!(self.buf, "# HELP {name} {help}");
        let _ = writeln!(self.buf, "# TYPE {name} gauge");
        for (labels, value) in series {
            let rendered: Vec<String> = labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('"', "'")))
                .collect();
            let _ = writeln!(self.buf, "{name}{{{}}} {value}", rendered.join(","));
        }
        self
    }

    pub fn finish(&self) -> String {
        self.buf.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counters_and_gauges() {
        let mut page = PrometheusText::new();
        page.counter("mano_reconcile_total", "Total reconciliations", 42)
            .gauge("mano_reconcile_concurrency", "In-flight reconciles", 3.0);
        let text = page.finish();
        assert!(text.contains("# TYPE mano_reconcile_total counter"));
        assert!(text.contains("mano_reconcile_total 42"));
        assert!(text.contains("mano_reconcile_concurrency 3"));
    }

    #[test]
    fn renders_labeled_series() {
        let mut page = PrometheusText::new();
        page.labeled_gauge(
            "mano_agent_bandwidth_bps",
            "Measured interface bandwidth",
            &[(
                vec![
                    ("interface".to_string(), "vxlan100".to_string()),
                    ("direction".to_string(), "rx".to_string()),
                ],
                1_500_000.0,
            )],
        );
        let text = page.finish();
        assert!(text.contains("mano_agent_bandwidth_bps{interface=\"vxlan100\",direction=\"rx\"} 1500000"));
    }
}
