/// Example client that subscribes to Bybit's public trade stream and keeps it alive with pings.
use std::time::Duration;

use tokio::time::interval;
use wsclient::{
    events::{Event, EventKind},
    CloseCode, Settings, WebSocket,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Debug).expect("log");

    let ws = WebSocket::new(
        "wss://stream.bybit.com/v5/public/linear",
        Settings::default()
            .with_certificate_verification()
            .with_retry_limit(3)
            .with_max_backoff(Duration::from_secs(8)),
    );

    ws.on(EventKind::Open, |_| log::info!("Connected"));
    ws.on(EventKind::Text, |event| {
        if let Event::Text(text) = event {
            match serde_json::from_str::<serde_json::Value>(text) {
                Ok(value) => log::info!("{value}"),
                Err(err) => log::warn!("not json ({err}): {text}"),
            }
        }
    });
    ws.on(EventKind::Pong, |event| {
        if let Event::Pong(data) = event {
            log::debug!("Pong: {}", String::from_utf8_lossy(data));
        }
    });
    ws.on(EventKind::Error, |event| {
        if let Event::Error(err) = event {
            log::error!("{err}");
        }
    });
    ws.on(EventKind::Close, |event| log::info!("{event:?}"));

    if !ws.connect().await? {
        anyhow::bail!("connection was not opened");
    }

    let subscribe = r#"{
        "req_id": "1",
        "op": "subscribe",
        "args": [
            "publicTrade.BTCUSDT"
        ]
    }"#;
    ws.send_text(subscribe).await;

    let mut ival = interval(Duration::from_secs(3));
    for _ in 0..10 {
        ival.tick().await;
        if !ws.ping("idk").await {
            log::debug!("Disconnected");
            return Ok(());
        }
    }

    ws.close(Some(CloseCode::Normal), Some("done"), false).await?;
    Ok(())
}
