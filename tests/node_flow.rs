//! End-to-end join, playback and failover against local audio nodes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use serenity::gateway::ConnectionStage;
use serenity::model::id::{ChannelId, GuildId, UserId};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use voicelink::{
    GatewayClient, JoinOptions, ManagerOptions, NodeAddress, NodeState, PlayOptions,
    PlayerEvent, PlayerManager, VoiceServerUpdate,
};

const WAIT: Duration = Duration::from_secs(5);

/// Audio node stand-in: reports one stats sample, records every frame it gets
struct FakeNode {
    port: u16,
    frames: mpsc::UnboundedReceiver<Value>,
    control: mpsc::UnboundedSender<Message>,
}

impl FakeNode {
    async fn spawn(system_load: f64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let (control, mut control_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let stats = json!({
                "op": "stats",
                "players": 0,
                "playingPlayers": 0,
                "cpu": {"cores": 1, "systemLoad": system_load}
            });
            ws.send(Message::text(stats.to_string())).await.unwrap();

            loop {
                tokio::select! {
                    frame = ws.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            let value: Value = serde_json::from_str(text.as_str()).unwrap();
                            let _ = frame_tx.send(value);
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    },
                    outgoing = control_rx.recv() => match outgoing {
                        Some(Message::Close(frame)) => {
                            let _ = ws.close(frame).await;
                            break;
                        }
                        Some(message) => {
                            if ws.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Self {
            port,
            frames,
            control,
        }
    }

    fn address(&self) -> NodeAddress {
        NodeAddress::new("127.0.0.1", self.port, None)
    }

    fn key(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    async fn next_frame(&mut self) -> Value {
        timeout(WAIT, self.frames.recv())
            .await
            .expect("node frame in time")
            .expect("node socket open")
    }

    fn push(&self, frame: Value) {
        self.control.send(Message::text(frame.to_string())).unwrap();
    }

    fn close(&self) {
        self.control.send(Message::Close(None)).unwrap();
    }
}

#[derive(Default)]
struct TestGateway {
    sent: Mutex<Vec<(u64, u8, Value)>>,
}

#[async_trait]
impl GatewayClient for TestGateway {
    async fn get_channel(&self, channel_id: ChannelId) -> Option<ChannelId> {
        Some(channel_id)
    }

    fn shard_stage(&self, _shard_id: u64) -> Option<ConnectionStage> {
        Some(ConnectionStage::Connected)
    }

    async fn send_ws(&self, shard_id: u64, op: u8, payload: Value) -> voicelink::Result<()> {
        self.sent.lock().push((shard_id, op, payload));
        Ok(())
    }
}

fn server_update(guild_id: GuildId, endpoint: &str) -> VoiceServerUpdate {
    VoiceServerUpdate {
        guild_id,
        session_id: "voice-session".to_string(),
        endpoint: endpoint.to_string(),
        token: "voice-token".to_string(),
        channel_id: None,
        shard_id: 0,
    }
}

async fn wait_for_nodes(manager: &PlayerManager, count: usize) {
    timeout(WAIT, async {
        loop {
            let nodes = manager.nodes().await.unwrap();
            let ready = nodes
                .iter()
                .filter(|n| n.state == NodeState::Ready && n.stats.is_some())
                .count();
            if ready == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("nodes ready in time");
}

#[tokio::test]
async fn test_join_play_and_failover_between_nodes() {
    let mut quiet = FakeNode::spawn(0.1).await;
    let mut busy = FakeNode::spawn(0.9).await;
    let gateway = Arc::new(TestGateway::default());

    let manager = PlayerManager::new(
        vec![quiet.address(), busy.address()],
        ManagerOptions::new(UserId::new(1000)),
        gateway.clone(),
    );
    wait_for_nodes(&manager, 2).await;

    assert_eq!(
        manager.find_ideal_node(None).await.unwrap(),
        Some(quiet.key())
    );

    // Join: la carga más baja gana
    let guild = GuildId::new(42);
    let join = tokio::spawn({
        let manager = manager.clone();
        async move {
            manager
                .join(guild, ChannelId::new(7), JoinOptions::default())
                .await
        }
    });

    let connect = quiet.next_frame().await;
    assert_eq!(connect, json!({"op": "connect", "guildId": "42", "channelId": "7"}));

    manager
        .voice_server_update(server_update(guild, "us-east123.discord.media"))
        .unwrap();
    let player = timeout(WAIT, join).await.unwrap().unwrap().unwrap();
    assert_eq!(player.node(), quiet.key());
    assert_eq!(manager.players().await.unwrap(), vec![guild]);

    let voice = quiet.next_frame().await;
    assert_eq!(voice["op"], "voiceUpdate");
    assert_eq!(voice["sessionId"], "voice-session");
    assert_eq!(voice["event"]["token"], "voice-token");

    let mut events = player.subscribe();
    player.play("track-1", PlayOptions::default());
    let play = quiet.next_frame().await;
    assert_eq!(play, json!({"op": "play", "guildId": "42", "track": "track-1"}));
    assert!(player.is_playing());

    quiet.push(json!({
        "op": "playerUpdate",
        "guildId": "42",
        "state": {"position": 1000, "time": 1_700_000_000_000u64}
    }));
    timeout(WAIT, async {
        while player.position() != Some(1000) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("player update applied");

    // Caída del nodo: la sesión migra al otro nodo
    quiet.close();

    let reconnect = busy.next_frame().await;
    assert_eq!(reconnect, json!({"op": "connect", "guildId": "42", "channelId": "7"}));

    let left = gateway.sent.lock().clone();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].1, 4);
    assert_eq!(left[0].2["guild_id"], "42");
    assert!(left[0].2["channel_id"].is_null());

    manager
        .voice_server_update(server_update(guild, "us-west456.discord.media"))
        .unwrap();

    let voice = busy.next_frame().await;
    assert_eq!(voice["op"], "voiceUpdate");
    assert_eq!(voice["event"]["endpoint"], "us-west456.discord.media");

    let resumed = busy.next_frame().await;
    assert_eq!(resumed["op"], "play");
    assert_eq!(resumed["track"], "track-1");
    assert_eq!(resumed["startTime"], 3000);

    let saw_reconnect = timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(PlayerEvent::Reconnect) => return true,
                Ok(PlayerEvent::End(_)) | Ok(PlayerEvent::Disconnect(_)) => return false,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap();
    assert!(saw_reconnect);
    assert_eq!(player.node(), busy.key());
    assert!(player.is_playing());

    // El shutdown cierra el socket del nodo
    manager.shutdown().await.unwrap();
    let closed = timeout(WAIT, busy.frames.recv()).await.unwrap();
    assert!(closed.is_none());
}
