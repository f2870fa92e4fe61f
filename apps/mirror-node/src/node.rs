use std::sync::Arc;

use anyhow::Context;
use mirror_channels::{BackMasterChannel, FrontMasterChannel};
use tokio::task::JoinHandle;
use tracing::info;
use transport_bus::{Bus, LocalBus};

use crate::config::NodeConfig;
use crate::pipeline;

/// The masters hosted by one process plus the loop that flushes them.
pub struct Node {
    front: Option<FrontMasterChannel>,
    back: Option<BackMasterChannel>,
    flush: JoinHandle<()>,
}

impl Node {
    /// Starts on a private in-process bus.
    pub async fn start(cfg: &NodeConfig) -> anyhow::Result<Self> {
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::with_capacity(cfg.bus_capacity));
        Self::start_on(bus, cfg).await
    }

    /// Builds the back master first so a co-hosted front finds it when
    /// connecting.
    pub async fn start_on(bus: Arc<dyn Bus>, cfg: &NodeConfig) -> anyhow::Result<Self> {
        let back = if cfg.role.hosts_back() {
            let back = BackMasterChannel::new(
                cfg.channel_ids.iter().cloned(),
                cfg.back_master_index,
                Arc::clone(&bus),
            )
            .context("creating back master")?;
            info!(
                back_master_index = cfg.back_master_index,
                channels = ?back.channel_ids(),
                "back master ready"
            );
            Some(back)
        } else {
            None
        };

        let front = if cfg.role.hosts_front() {
            let front = FrontMasterChannel::new(
                cfg.channel_ids.iter().cloned(),
                cfg.front_master_index,
                Arc::clone(&bus),
                cfg.master_options(),
            )
            .context("creating front master")?;
            let back_masters = front
                .connect()
                .await
                .context("connecting front master")?;
            info!(
                front_master_index = cfg.front_master_index,
                back_masters = ?back_masters,
                "front master connected"
            );
            Some(front)
        } else {
            None
        };

        let flush = pipeline::start_flush_loop(front.clone(), back.clone(), cfg.flush_interval_ms);
        Ok(Self { front, back, flush })
    }

    pub fn front(&self) -> Option<&FrontMasterChannel> {
        self.front.as_ref()
    }

    pub fn back(&self) -> Option<&BackMasterChannel> {
        self.back.as_ref()
    }

    /// Stops flushing and closes the front before the back.
    pub fn shutdown(self) {
        self.flush.abort();
        if let Some(front) = &self.front {
            front.close();
        }
        if let Some(back) = &self.back {
            back.close();
        }
        info!("mirror node stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use super::*;
    use crate::config::Role;

    fn config(role: Role) -> NodeConfig {
        let mut cfg = NodeConfig::from_lookup(|_| None);
        cfg.role = role;
        cfg.channel_ids = vec!["lobby".into(), "arena".into()];
        cfg.flush_interval_ms = 5;
        cfg
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never held");
    }

    #[tokio::test]
    async fn co_hosted_node_flushes_client_messages() {
        let node = Node::start(&config(Role::Both)).await.unwrap();
        let back = node.back().unwrap().channel("arena").unwrap();
        let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
        {
            let seen = Arc::clone(&seen);
            back.on_message(move |inbound| seen.lock().push(inbound.message));
        }

        let client = node.front().unwrap().create_client("player-1");
        client.link_channel("arena", None).await.unwrap();
        client.set_processor_channel("arena", false, None, None).unwrap();
        client.send_local(json!({"move": "left"})).unwrap();

        wait_for(|| seen.lock().len() == 1).await;
        assert_eq!(seen.lock()[0], json!({"move": "left"}));
        node.shutdown();
    }

    #[tokio::test]
    async fn split_roles_meet_on_a_shared_bus() {
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
        let back_node = Node::start_on(Arc::clone(&bus), &config(Role::Back))
            .await
            .unwrap();
        assert!(back_node.front().is_none());

        let front_node = Node::start_on(bus, &config(Role::Front)).await.unwrap();
        let front = front_node.front().unwrap();
        assert_eq!(front.connected_back_masters().into_iter().collect::<Vec<_>>(), vec![0]);

        let back = back_node.back().unwrap().channel("lobby").unwrap();
        back.set_state(json!({"players": 0})).unwrap();
        let client = front.create_client("p");
        let response = client.link_channel("lobby", None).await.unwrap();
        assert!(!response.encoded_state.is_empty());

        front_node.shutdown();
        back_node.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn front_alone_times_out() {
        let mut cfg = config(Role::Front);
        cfg.connect_timeout_ms = 100;
        let err = Node::start(&cfg).await.err().unwrap();
        assert!(format!("{err:#}").contains("connecting front master"));
    }
}
