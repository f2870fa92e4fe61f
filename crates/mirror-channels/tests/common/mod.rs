#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mirror_channels::protocol::{self, ConnectionChange};
use mirror_channels::types::ConnectionSignal;
use mirror_channels::{
    topic_for, BackMasterChannel, FrontMasterChannel, FrontUid, MasterOptions, Operation,
    ProtocolMessage,
};
use tokio::sync::broadcast;
use transport_bus::{Bus, BusMessage, LocalBus};

pub struct Cluster {
    pub bus: Arc<LocalBus>,
    pub fronts: Vec<FrontMasterChannel>,
    pub backs: Vec<BackMasterChannel>,
}

/// `back_layout[i]` lists the channels hosted by back master `i`; every
/// front master hosts all of them.
pub async fn connected_cluster(back_layout: &[&[&str]], front_masters: u32) -> Cluster {
    let bus = Arc::new(LocalBus::new());
    let mut backs = Vec::new();
    let mut all_ids = Vec::new();
    for (index, ids) in back_layout.iter().enumerate() {
        backs.push(BackMasterChannel::new(ids.iter().copied(), index as u32, bus.clone()).unwrap());
        all_ids.extend(ids.iter().map(|id| id.to_string()));
    }
    let mut fronts = Vec::new();
    for index in 0..front_masters {
        let front =
            FrontMasterChannel::new(all_ids.clone(), index, bus.clone(), MasterOptions::default())
                .unwrap();
        front.connect().await.unwrap();
        fronts.push(front);
    }
    Cluster { bus, fronts, backs }
}

pub fn publish(bus: &LocalBus, operation: Operation, scope: Option<&str>, message: &ProtocolMessage) {
    bus.publish(&topic_for(operation, scope), protocol::encode(message).unwrap())
        .unwrap();
}

pub fn listen(bus: &LocalBus, operation: Operation, scope: Option<&str>) -> broadcast::Receiver<BusMessage> {
    bus.subscribe(&topic_for(operation, scope))
}

pub async fn next_message(rx: &mut broadcast::Receiver<BusMessage>) -> ProtocolMessage {
    let frame = rx.recv().await.expect("bus frame");
    protocol::decode(&frame.payload).expect("decodable frame")
}

/// Plays a back channel acknowledging `front_uid`.
pub fn ack(bus: &LocalBus, front_uid: &FrontUid, back_channel_id: &str, back_master_index: u32) {
    publish(
        bus,
        Operation::ConnectionChange,
        Some(front_uid.as_str()),
        &ProtocolMessage::ConnectionChange(ConnectionChange {
            channel_id: back_channel_id.to_string(),
            back_master_index,
            connection_status: ConnectionSignal::Connected,
            options: None,
        }),
    );
}

/// Lets pump tasks drain whatever is already published.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held: {what}");
}
