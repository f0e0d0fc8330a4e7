use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::errors::TransferError;
use crate::session::{IncomingOffer, Progress, TransferObserver, TransferSession, TransferSummary};
use crate::wsproto::PeerInfo;

/// Reports transfers through the logger and asks for consent on stdin.
pub struct ConsoleObserver {
    auto_accept: bool,
    // last reported 10% step per (peer, file)
    steps: Mutex<HashMap<(String, String), u8>>,
}

impl ConsoleObserver {
    pub fn new(auto_accept: bool) -> Self {
        Self {
            auto_accept,
            steps: Mutex::new(HashMap::new()),
        }
    }
}

fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn ask(question: String) -> bool {
    print!("{question} [y/N] ");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(_) => false,
    }
}

impl TransferObserver for ConsoleObserver {
    fn on_peers(&self, peers: &[PeerInfo]) {
        let names: Vec<String> = peers.iter().map(|p| format!("{} ({})", p.name, p.id)).collect();
        crate::logging::info_kv("peers", &[("count", &peers.len().to_string()), ("list", &names.join(", "))]);
    }

    fn on_state(&self, session: &TransferSession) {
        crate::logging::debug(format!(
            "{} {} {}",
            session.direction().as_str(),
            session.file_meta().name,
            session.state().as_str()
        ));
    }

    fn on_progress(&self, progress: &Progress) {
        let step = progress.percent() / 10;
        let key = (progress.peer_id.clone(), progress.file_name.clone());
        let mut steps = self.steps.lock().unwrap_or_else(|p| p.into_inner());
        if steps.get(&key).is_some_and(|last| *last >= step) {
            return;
        }
        steps.insert(key, step);
        crate::logging::info(format!(
            "{} {} {}% ({} / {})",
            progress.direction.as_str(),
            progress.file_name,
            progress.percent(),
            human_bytes(progress.bytes_transferred),
            human_bytes(progress.total_bytes)
        ));
    }

    fn on_complete(&self, summary: &TransferSummary) {
        self.steps
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(summary.peer_id.clone(), summary.file_meta.name.clone()));
        crate::logging::info_kv(
            "transfer complete",
            &[
                ("direction", summary.direction.as_str()),
                ("file", &summary.file_meta.name),
                ("bytes", &summary.bytes_transferred.to_string()),
                ("transport", summary.transport.map_or("none", |t| t.as_str())),
                ("encrypted", if summary.encrypted { "true" } else { "false" }),
            ],
        );
    }

    fn on_failed(&self, session: &TransferSession, err: &TransferError) {
        crate::logging::error_kv(
            "transfer failed",
            &[
                ("direction", session.direction().as_str()),
                ("file", &session.file_meta().name),
                ("error", &err.to_string()),
            ],
        );
    }

    fn decide_offer<'a>(&'a self, offer: &'a IncomingOffer) -> BoxFuture<'a, bool> {
        if self.auto_accept {
            return async { true }.boxed();
        }
        let names: Vec<&str> = offer.files.iter().map(|f| f.name.as_str()).collect();
        let question = format!(
            "{} wants to send {} file(s), {}: {}. Accept?",
            offer.sender_name,
            offer.files.len(),
            human_bytes(offer.total_bytes()),
            names.join(", ")
        );
        async move {
            tokio::task::spawn_blocking(move || ask(question))
                .await
                .unwrap_or(false)
        }
        .boxed()
    }
}
