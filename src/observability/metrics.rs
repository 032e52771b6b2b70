use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub orders_placed_total: IntCounter,
    pub assignments_total: IntCounterVec,
    pub accept_attempts_total: IntCounterVec,
    pub otp_verifications_total: IntCounterVec,
    pub open_offers: IntGauge,
    pub connected_clients: IntGauge,
    pub assignment_wait_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let orders_placed_total =
            IntCounter::new("orders_placed_total", "Total orders accepted at checkout")
                .expect("valid orders_placed_total metric");

        let assignments_total = IntCounterVec::new(
            Opts::new("assignments_total", "Assignment rounds by outcome"),
            &["outcome"],
        )
        .expect("valid assignments_total metric");

        let accept_attempts_total = IntCounterVec::new(
            Opts::new("accept_attempts_total", "Accept calls by outcome"),
            &["outcome"],
        )
        .expect("valid accept_attempts_total metric");

        let otp_verifications_total = IntCounterVec::new(
            Opts::new(
                "otp_verifications_total",
                "Delivery code verifications by outcome",
            ),
            &["outcome"],
        )
        .expect("valid otp_verifications_total metric");

        let open_offers = IntGauge::new("open_offers", "Assignment rounds currently broadcast")
            .expect("valid open_offers metric");

        let connected_clients =
            IntGauge::new("connected_clients", "Registered realtime connections")
                .expect("valid connected_clients metric");

        let assignment_wait_seconds = Histogram::with_opts(HistogramOpts::new(
            "assignment_wait_seconds",
            "Time from offer broadcast to winning accept in seconds",
        ))
        .expect("valid assignment_wait_seconds metric");

        registry
            .register(Box::new(orders_placed_total.clone()))
            .expect("register orders_placed_total");
        registry
            .register(Box::new(assignments_total.clone()))
            .expect("register assignments_total");
        registry
            .register(Box::new(accept_attempts_total.clone()))
            .expect("register accept_attempts_total");
        registry
            .register(Box::new(otp_verifications_total.clone()))
            .expect("register otp_verifications_total");
        registry
            .register(Box::new(open_offers.clone()))
            .expect("register open_offers");
        registry
            .register(Box::new(connected_clients.clone()))
            .expect("register connected_clients");
        registry
            .register(Box::new(assignment_wait_seconds.clone()))
            .expect("register assignment_wait_seconds");

        Self {
            registry,
            orders_placed_total,
            assignments_total,
            accept_attempts_total,
            otp_verifications_total,
            open_offers,
            connected_clients,
            assignment_wait_seconds,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
