//! Terminal front-end for whoever runs the relay.

use anyhow::Result;
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{info, warn};

use crate::{
    cli::RelayArgs,
    console::{spawn_line_reader, write_stdout},
    protocol::broadcast_line,
    relay::{Departure, Relay, RelayHandle, RelayNotice},
};

pub async fn serve(args: RelayArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen).await?;
    let relay = Relay::new(listener, args.config());
    let addr = relay.local_addr()?;
    info!("relay listening on {}", addr);

    tokio::spawn(show_notices(relay.subscribe()));
    tokio::spawn(forward_announcements(relay.handle()));

    if let Err(err) = relay.run_until_ctrl_c().await {
        warn!("relay exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

async fn forward_announcements(relay: RelayHandle) {
    let mut input = spawn_line_reader();
    while let Some(line) = input.recv().await {
        if relay.announce(line).await.is_err() {
            break;
        }
    }
}

async fn show_notices(mut notices: broadcast::Receiver<RelayNotice>) {
    loop {
        let notice = match notices.recv().await {
            Ok(notice) => notice,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "notice display fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if write_stdout(&render_notice(&notice)).await.is_err() {
            return;
        }
    }
}

fn render_notice(notice: &RelayNotice) -> String {
    match notice {
        RelayNotice::ClientJoined { name, peer, .. } => format!("*** {name} joined from {peer}"),
        RelayNotice::ClientLeft {
            name, departure, ..
        } => match departure {
            Departure::Requested => format!("*** {name} left"),
            Departure::Lost(reason) => format!("*** {name} disconnected ({reason})"),
            Departure::Shutdown => format!("*** {name} dropped at shutdown"),
        },
        RelayNotice::Message { from, text } => broadcast_line(from, text),
    }
}
