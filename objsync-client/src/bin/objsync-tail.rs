//! Tail a notification stream.
//!
//! ```text
//! objsync-tail ws://localhost:8080/v1/stream?token=... [objects.todos]
//! ```
//!
//! Logs every Event (optionally only one object type) and every connection
//! state change until interrupted. `RUST_LOG` controls verbosity.

use futures_util::StreamExt;
use log::{error, info};
use objsync_wire::{ChannelConfig, CloseStatus, NotificationChannel};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let Some(url) = args.next() else {
        eprintln!("usage: objsync-tail <ws-url> [objectType]");
        std::process::exit(2);
    };
    let object_type = args.next();

    let channel = match NotificationChannel::spawn(ChannelConfig::new(url)) {
        Ok(channel) => channel,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    };
    info!("Tailing {}", channel.endpoint().authority());

    let mut state = channel.watch_state();
    let events = channel.events();
    futures_util::pin_mut!(events);

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => {
                    let wanted = object_type
                        .as_deref()
                        .map_or(true, |wanted| wanted == event.object_type);
                    if wanted {
                        info!("{}", event.to_json());
                    }
                }
                None => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                info!("Connection {:?}", *state.borrow_and_update());
            }
            _ = tokio::signal::ctrl_c() => {
                channel.shutdown(CloseStatus::NORMAL).await;
                return;
            }
        }
    }
    info!("Notification channel stopped");
}
