use std::error::Error;
use std::time::Duration;

use gamelink_sdk::realtime::proto::ChannelType;
use gamelink_sdk::realtime::StreamKey;
use gamelink_sdk::retry::ReconnectPolicy;
use gamelink_sdk::{Listeners, RealtimeClient, Session, SessionHolder};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = "REPLACE_WITH_SESSION_TOKEN".to_string();
    let room = "lobby".to_string();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let sessions = SessionHolder::new(Session::restore(token, None)?);
        let listeners = Listeners::new()
            .on_connect(|| println!("connected"))
            .on_disconnect(|info| println!("disconnected: {info}"))
            .on_error(|err| eprintln!("server error: {err}"))
            .on_channel_message(|msg| {
                println!("[{}] {}: {}", msg.channel_id, msg.username, msg.content)
            })
            .on_party_presence(|diff| {
                println!(
                    "party {} joins={} leaves={}",
                    diff.party_id,
                    diff.joins.len(),
                    diff.leaves.len()
                )
            })
            .on_party_data(|data| {
                println!("party data op_code={} bytes={}", data.op_code, data.data.len())
            });

        let connection = RealtimeClient::new("127.0.0.1")
            .with_reconnect_policy(ReconnectPolicy::unlimited())
            .connect(sessions, listeners)
            .await?;

        let channel = connection
            .join_chat(room, ChannelType::Room, false, false)
            .await?;
        let ack = connection
            .write_chat_message(&channel.id, r#"{"text":"hello from the party demo"}"#)
            .await?;
        println!("sent message_id={}", ack.message_id);

        let party = connection.create_party(true, 4).await?;
        println!("created party_id={} max_size={}", party.party_id, party.max_size);
        connection.send_party_data(&party.party_id, 7, b"ready".to_vec())?;

        tokio::time::sleep(Duration::from_secs(30)).await;

        if let Some(members) = connection
            .presence()
            .presences(&StreamKey::Party(party.party_id.clone()))
        {
            println!("party members: {:?}", members.user_ids());
        }

        connection.close_party(&party.party_id).await?;
        connection.leave_chat(&channel.id).await?;
        connection.close().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
