use std::time::Duration;

use mirror_channels::{BackMasterChannel, FlushReport, FrontMasterChannel};
use tokio::time::MissedTickBehavior;
use tracing::trace;

use crate::metrics;

pub const FRONT_TO_BACK: &str = "front_to_back";
pub const BACK_TO_FRONT: &str = "back_to_front";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushRound {
    pub front_to_back: FlushReport,
    pub back_to_front: FlushReport,
}

/// Flushes both directions once and records what went out.
pub fn flush_once(front: Option<&FrontMasterChannel>, back: Option<&BackMasterChannel>) -> FlushRound {
    let round = FlushRound {
        front_to_back: front.map(FrontMasterChannel::send_queued_messages).unwrap_or_default(),
        back_to_front: back.map(BackMasterChannel::send_queued_messages).unwrap_or_default(),
    };
    record(FRONT_TO_BACK, round.front_to_back);
    record(BACK_TO_FRONT, round.back_to_front);
    if round != FlushRound::default() {
        trace!(
            front_to_back = round.front_to_back.messages,
            back_to_front = round.back_to_front.messages,
            "flushed queued messages"
        );
    }
    round
}

fn record(direction: &str, report: FlushReport) {
    if report.is_empty() {
        return;
    }
    metrics::FLUSHED_BATCHES
        .with_label_values(&[direction])
        .inc_by(report.batches as u64);
    metrics::FLUSHED_MESSAGES
        .with_label_values(&[direction])
        .inc_by(report.messages as u64);
}

pub fn start_flush_loop(
    front: Option<FrontMasterChannel>,
    back: Option<BackMasterChannel>,
    interval_ms: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            flush_once(front.as_ref(), back.as_ref());
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mirror_channels::MasterOptions;
    use serde_json::json;
    use transport_bus::LocalBus;

    use super::*;

    #[tokio::test]
    async fn flush_once_reports_and_counts_each_direction() {
        let bus = Arc::new(LocalBus::new());
        let back = BackMasterChannel::new(["a"], 0, bus.clone()).unwrap();
        let front = FrontMasterChannel::new(["a"], 0, bus, MasterOptions::default()).unwrap();
        front.connect().await.unwrap();
        let client = front.create_client("c1");
        client.link_channel("a", None).await.unwrap();
        client.set_processor_channel("a", false, None, None).unwrap();

        client.send_local(json!(1)).unwrap();
        client.send_local(json!(2)).unwrap();
        let before = metrics::FLUSHED_MESSAGES
            .with_label_values(&[FRONT_TO_BACK])
            .get();

        let round = flush_once(Some(&front), Some(&back));
        assert_eq!(round.front_to_back.batches, 1);
        assert_eq!(round.front_to_back.messages, 2);
        assert!(round.back_to_front.is_empty());
        let after = metrics::FLUSHED_MESSAGES
            .with_label_values(&[FRONT_TO_BACK])
            .get();
        assert!(after >= before + 2);

        assert_eq!(flush_once(Some(&front), None), FlushRound::default());
        assert_eq!(flush_once(None, None), FlushRound::default());
    }
}
