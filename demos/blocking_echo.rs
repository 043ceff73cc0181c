//! Sends a few messages to an echo server from plain threads.
//!
//! Run an echo server on `ws://127.0.0.1:9001/` first, or pass another URI as the first argument.

use std::{
    sync::{mpsc, Mutex},
    time::Duration,
};

use wsclient::{
    blocking::WebSocket,
    events::{Event, EventKind},
    Settings,
};

fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Info).expect("log");

    let uri = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:9001/".to_owned());

    let ws = WebSocket::new(uri, Settings::default().with_write_fragment_size(16))?;

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    ws.on(EventKind::Text, move |event| {
        if let Event::Text(text) = event {
            let _ = tx.lock().map(|tx| tx.send(text.clone()));
        }
    });

    ws.connect()?;

    for i in 0..3 {
        // long enough to go out as several frames
        ws.send_text(format!("message number {i} from the blocking client"));
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(echo) => log::info!("<< {echo}"),
            Err(_) => log::warn!("no echo for message {i}"),
        }
    }

    ws.close(None, Some("bye"), false)?;
    log::info!("closed in state {:?}", ws.state());
    Ok(())
}
