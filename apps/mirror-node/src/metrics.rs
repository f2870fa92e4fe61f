use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static BOOT_COUNTER: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new("mirror_node_boot_total", "mirror node boots"))
        .expect("valid counter opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static FLUSHED_BATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "mirror_flushed_batches_total",
            "queued batches published by direction",
        ),
        &["direction"],
    )
    .expect("valid counter opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static FLUSHED_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "mirror_flushed_messages_total",
            "queued messages published by direction",
        ),
        &["direction"],
    )
    .expect("valid counter opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "metrics encode error");
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_counters_show_up_in_text_output() {
        BOOT_COUNTER.inc();
        FLUSHED_BATCHES.with_label_values(&["front_to_back"]).inc_by(0);
        let text = String::from_utf8(gather()).unwrap();
        assert!(text.contains("mirror_node_boot_total"));
        assert!(text.contains("mirror_flushed_batches_total{direction=\"front_to_back\"}"));
    }
}
