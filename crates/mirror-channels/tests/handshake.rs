mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ack, connected_cluster, eventually, listen, next_message, settle};
use mirror_channels::{
    Channel, ChannelError, ConnectionStatus, FrontMasterChannel, MasterOptions, Operation,
    ProtocolMessage,
};
use transport_bus::{Bus, LocalBus};

fn front_master(bus: &Arc<LocalBus>) -> FrontMasterChannel {
    FrontMasterChannel::new(["A", "B"], 0, bus.clone(), MasterOptions::default()).unwrap()
}

#[tokio::test]
async fn connect_resolves_once_every_channel_acknowledged() {
    let bus = Arc::new(LocalBus::new());
    let master = front_master(&bus);
    let front = master.channel("A").unwrap();
    let mut announces = listen(&bus, Operation::Connect, None);

    let connecting = tokio::spawn({
        let front = front.clone();
        async move { front.connect(Duration::from_secs(15)).await }
    });
    let announce = match next_message(&mut announces).await {
        ProtocolMessage::Connect(request) => request,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(announce.front_uid.as_str(), "A-0");
    assert_eq!(announce.channel_id, "A");
    assert_eq!(announce.front_master_index, 0);

    ack(&bus, &announce.front_uid, "A", 1);
    ack(&bus, &announce.front_uid, "A", 1);
    ack(&bus, &announce.front_uid, "B", 2);

    let outcome = connecting.await.unwrap().unwrap();
    assert_eq!(outcome.channel_ids, vec!["A".to_string(), "B".to_string()]);
    assert_eq!(outcome.back_master_indexes, vec![1, 2]);
    assert_eq!(front.connection_status(), ConnectionStatus::Connected);
    assert_eq!(front.back_master_index(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn connect_times_out_reporting_outstanding_channels() {
    let bus = Arc::new(LocalBus::new());
    let master = front_master(&bus);
    let front = master.channel("A").unwrap();
    let mut announces = listen(&bus, Operation::Connect, None);

    let connecting = tokio::spawn({
        let front = front.clone();
        async move { front.connect(Duration::from_secs(15)).await }
    });
    let _ = next_message(&mut announces).await;
    ack(&bus, front.front_uid(), "A", 0);

    let err = connecting.await.unwrap().unwrap_err();
    match &err {
        ChannelError::ConnectTimeout { outstanding, .. } => assert_eq!(*outstanding, 1),
        other => panic!("unexpected {other:?}"),
    }
    assert!(err.to_string().contains("1 connection"));
    assert_eq!(front.connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(front.connected_channel_ids(), vec!["A".to_string()]);
}

#[tokio::test]
async fn second_connect_is_rejected() {
    let bus = Arc::new(LocalBus::new());
    let master = front_master(&bus);
    let front = master.channel("B").unwrap();

    let pending = tokio::spawn({
        let front = front.clone();
        async move { front.connect(Duration::from_secs(15)).await }
    });
    eventually("front is connecting", || {
        front.connection_status() == ConnectionStatus::Connecting
    })
    .await;

    let err = front.connect(Duration::from_secs(1)).await.unwrap_err();
    assert!(err.is_misuse());
    assert!(err
        .to_string()
        .contains("connected or in the process of connecting"));

    ack(&bus, front.front_uid(), "A", 0);
    ack(&bus, front.front_uid(), "B", 0);
    pending.await.unwrap().unwrap();
    let err = front.connect(Duration::from_secs(1)).await.unwrap_err();
    assert!(err.is_misuse());
}

#[tokio::test]
async fn masters_discover_each_other() {
    let cluster = connected_cluster(&[&["A"], &["B"]], 2).await;

    for front in &cluster.fronts {
        let discovered: Vec<u32> = front.connected_back_masters().into_iter().collect();
        assert_eq!(discovered, vec![0, 1]);
        for channel in front.channels() {
            assert_eq!(channel.connection_status(), ConnectionStatus::Connected);
        }
    }
    assert_eq!(cluster.fronts[1].channel("B").unwrap().back_master_index(), Some(1));

    let back_a = cluster.backs[0].channel("A").unwrap();
    assert_eq!(back_a.connected_fronts_data().len(), 4);
    let mirrored: Vec<String> = back_a
        .mirrored_front_uids()
        .iter()
        .map(|uid| uid.to_string())
        .collect();
    assert_eq!(mirrored, vec!["A-0".to_string(), "A-1".to_string()]);
}

#[tokio::test]
async fn closing_a_back_channel_disconnects_its_fronts() {
    let cluster = connected_cluster(&[&["A"], &["B"]], 1).await;
    let front_a = cluster.fronts[0].channel("A").unwrap();
    let front_b = cluster.fronts[0].channel("B").unwrap();

    cluster.backs[0].channel("A").unwrap().close();

    eventually("mirror dropped", || front_a.back_master_index().is_none()).await;
    assert_eq!(front_a.connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(front_a.connected_channel_ids(), vec!["B".to_string()]);
    eventually("peer dropped", || {
        front_b.connection_status() == ConnectionStatus::Disconnected
    })
    .await;
    assert_eq!(front_b.back_master_index(), Some(1));
    assert!(front_b.send(serde_json::json!({}), Some("A")).is_err());
}

#[tokio::test]
async fn unknown_connection_status_is_not_applied() {
    let bus = Arc::new(LocalBus::new());
    let master = front_master(&bus);
    let front = master.channel("A").unwrap();

    let frame = br#"{"type":"connection_change","payload":{"channel_id":"A","back_master_index":0,"connection_status":"RECONNECTING","options":null}}"#;
    bus.publish("9-A-0", bytes::Bytes::from_static(frame)).unwrap();
    settle().await;

    assert_eq!(front.connection_status(), ConnectionStatus::Disconnected);
    assert!(front.connected_channel_ids().is_empty());
    assert!(front.is_open());
    // the registration survives and still processes well-formed frames
    ack(&bus, front.front_uid(), "A", 3);
    eventually("ack recorded", || front.back_master_index() == Some(3)).await;
}

#[tokio::test(start_paused = true)]
async fn master_connect_can_be_retried_after_a_timeout() {
    let bus = Arc::new(LocalBus::new());
    let options = MasterOptions {
        connect_timeout: Duration::from_secs(1),
        ..MasterOptions::default()
    };
    let master = FrontMasterChannel::new(["A", "B"], 0, bus.clone(), options).unwrap();

    let err = master.connect().await.unwrap_err();
    assert!(err.is_timeout());
    for channel in master.channels() {
        assert_eq!(channel.connection_status(), ConnectionStatus::Disconnected);
    }

    let _backs = mirror_channels::BackMasterChannel::new(["A", "B"], 0, bus.clone()).unwrap();
    let discovered = master.connect().await.unwrap();
    assert_eq!(discovered.into_iter().collect::<Vec<_>>(), vec![0]);
    for channel in master.channels() {
        assert_eq!(channel.connection_status(), ConnectionStatus::Connected);
    }
    // nothing left to connect
    assert!(master.connect().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn abandoned_connect_leaves_the_channel_reusable() {
    let bus = Arc::new(LocalBus::new());
    let master = front_master(&bus);
    let front = master.channel("A").unwrap();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), front.connect(Duration::from_secs(15)))
            .await;
    assert!(abandoned.is_err());
    assert_eq!(front.connection_status(), ConnectionStatus::Disconnected);

    let connecting = tokio::spawn({
        let front = front.clone();
        async move { front.connect(Duration::from_secs(15)).await }
    });
    eventually("front is connecting again", || {
        front.connection_status() == ConnectionStatus::Connecting
    })
    .await;
    ack(&bus, front.front_uid(), "A", 0);
    ack(&bus, front.front_uid(), "B", 0);
    connecting.await.unwrap().unwrap();
}

#[tokio::test]
async fn front_hosting_a_subset_waits_for_the_whole_cluster() {
    let bus = Arc::new(LocalBus::new());
    let _first = mirror_channels::BackMasterChannel::new(["A", "B"], 0, bus.clone()).unwrap();
    let _second = mirror_channels::BackMasterChannel::new(["C"], 1, bus.clone()).unwrap();
    let options = MasterOptions {
        total_channels: Some(3),
        ..MasterOptions::default()
    };
    let master = FrontMasterChannel::new(["A"], 0, bus.clone(), options).unwrap();

    let discovered = master.connect().await.unwrap();
    assert_eq!(discovered.into_iter().collect::<Vec<_>>(), vec![0, 1]);
    let front = master.channel("A").unwrap();
    assert_eq!(front.total_channels(), 3);
    let mut reached = front.connected_channel_ids();
    reached.sort();
    assert_eq!(reached, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn front_hosting_a_subset_times_out_on_a_missing_channel() {
    let bus = Arc::new(LocalBus::new());
    let _backs = mirror_channels::BackMasterChannel::new(["A", "B"], 0, bus.clone()).unwrap();
    let options = MasterOptions {
        connect_timeout: Duration::from_secs(1),
        total_channels: Some(3),
        ..MasterOptions::default()
    };
    let master = FrontMasterChannel::new(["A"], 0, bus.clone(), options).unwrap();

    match master.connect().await.unwrap_err() {
        ChannelError::ConnectTimeout { outstanding, .. } => assert_eq!(outstanding, 1),
        other => panic!("unexpected {other:?}"),
    }

    let too_few = MasterOptions {
        total_channels: Some(1),
        ..MasterOptions::default()
    };
    let err = FrontMasterChannel::new(["A", "B"], 1, bus, too_few).err().unwrap();
    assert!(err.is_misuse());
}
