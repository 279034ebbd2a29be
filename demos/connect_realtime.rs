use std::collections::BTreeMap;
use std::error::Error;
use std::time::Duration;

use gamelink_sdk::realtime::{ClientEvent, RtEvent};
use gamelink_sdk::{Listeners, RealtimeClient, Session, SessionHolder};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = "REPLACE_WITH_SESSION_TOKEN".to_string();
    let match_id = "REPLACE_WITH_MATCH_ID".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let sessions = SessionHolder::new(Session::restore(token, None)?);
        let (listeners, mut events) = Listeners::channel();

        let connection = RealtimeClient::new("127.0.0.1")
            .with_create_status(true)
            .connect(sessions, listeners)
            .await?;

        let rtt = connection.ping().await?;
        println!("connected client_id={} rtt_ms={}", connection.client_id(), rtt.as_millis());

        let joined = connection.join_match(match_id, BTreeMap::new()).await?;
        println!("joined match_id={} size={}", joined.match_id, joined.size);
        connection.send_match_data(&joined.match_id, 1, b"hello".to_vec(), Vec::new(), true)?;

        let deadline = tokio::time::sleep(Duration::from_secs(30));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => match event {
                    Some(ClientEvent::Event(RtEvent::MatchData(data))) => {
                        println!("match_data op_code={} bytes={}", data.op_code, data.data.len());
                    }
                    Some(ClientEvent::Event(RtEvent::MatchPresenceEvent(diff))) => {
                        println!(
                            "presence joins={} leaves={}",
                            diff.joins.len(),
                            diff.leaves.len()
                        );
                    }
                    Some(ClientEvent::Disconnected(info)) => println!("disconnected: {info}"),
                    Some(_) => {}
                    None => break,
                },
            }
        }

        connection.leave_match(&joined.match_id).await?;
        connection.close().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
