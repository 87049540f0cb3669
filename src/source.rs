//! Inbound message producer.
//!
//! One task polls a [`MessageTransport`], retries with backoff, filters by
//! allow-list and message id, and hands messages to the control loop over
//! a bounded channel.

use std::{
    collections::{HashMap, VecDeque},
    io::{self, BufRead},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use tokio::{
    io::AsyncWriteExt,
    sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;

use crate::types::InboundMessage;

#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Next batch of messages; an empty batch means "nothing right now".
    async fn fetch(&self) -> Result<Vec<InboundMessage>>;
    async fn send(&self, chat_id: &str, text: &str) -> Result<()>;
}

/// Local channel: each stdin line is a message from chat `local`, replies
/// go to stdout.
///
/// Lines are read on a detached OS thread. A read blocked on the terminal
/// must never hold up runtime shutdown, which a blocking-pool read would.
pub struct StdinTransport {
    feed: Mutex<LineFeed>,
}

enum LineFeed {
    /// Reader thread not started until the first fetch.
    Pending(Box<dyn BufRead + Send>),
    Reading(mpsc::Receiver<io::Result<String>>),
    Closed,
}

impl Default for StdinTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl StdinTransport {
    pub const CHAT_ID: &'static str = "local";

    pub fn new() -> Self {
        Self::from_reader(io::BufReader::new(io::stdin()))
    }

    pub fn from_reader(reader: impl BufRead + Send + 'static) -> Self {
        Self {
            feed: Mutex::new(LineFeed::Pending(Box::new(reader))),
        }
    }
}

fn spawn_line_reader(
    reader: Box<dyn BufRead + Send>,
) -> io::Result<mpsc::Receiver<io::Result<String>>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::Builder::new()
        .name("burrow-stdin".into())
        .spawn(move || {
            for line in reader.lines() {
                let failed = line.is_err();
                if tx.blocking_send(line).is_err() || failed {
                    break;
                }
            }
        })?;
    Ok(rx)
}

#[async_trait]
impl MessageTransport for StdinTransport {
    async fn fetch(&self) -> Result<Vec<InboundMessage>> {
        let mut feed = self.feed.lock().await;
        if matches!(*feed, LineFeed::Pending(_)) {
            if let LineFeed::Pending(reader) = std::mem::replace(&mut *feed, LineFeed::Closed) {
                *feed = LineFeed::Reading(spawn_line_reader(reader)?);
            }
        }
        let LineFeed::Reading(lines) = &mut *feed else {
            return Ok(Vec::new());
        };
        match lines.recv().await {
            Some(Ok(line)) if line.trim().is_empty() => Ok(Vec::new()),
            Some(Ok(line)) => Ok(vec![InboundMessage::new(
                Self::CHAT_ID,
                Self::CHAT_ID,
                line.trim(),
            )]),
            Some(Err(error)) => {
                *feed = LineFeed::Closed;
                Err(error.into())
            }
            None => {
                tracing::info!(target = "burrow::source", "stdin closed, no more local messages");
                *feed = LineFeed::Closed;
                Ok(Vec::new())
            }
        }
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
        let mut stdout = tokio::io::stdout();
        let line = if chat_id == Self::CHAT_ID {
            format!("{text}\n")
        } else {
            format!("[{chat_id}] {text}\n")
        };
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Empty allows every sender.
    pub allow_list: Vec<String>,
    pub poll_interval: Duration,
}

impl SourceOptions {
    fn allows(&self, msg: &InboundMessage) -> bool {
        self.allow_list.is_empty()
            || self
                .allow_list
                .iter()
                .any(|allowed| allowed == &msg.sender || allowed == &msg.chat_id)
    }
}

/// Exponential backoff from 1s capped at 30s, plus up to 250ms jitter.
pub fn retry_delay(attempt: u32) -> Duration {
    let base_ms = (1_000u64).saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let bounded = base_ms.min(30_000);
    let jitter = rand::thread_rng().gen_range(0..=250);
    Duration::from_millis(bounded + jitter)
}

/// Runs until `token` is cancelled or the receiver is dropped.
pub async fn run_message_source(
    transport: Arc<dyn MessageTransport>,
    opts: SourceOptions,
    tx: mpsc::Sender<InboundMessage>,
    token: CancellationToken,
) {
    let mut seen = SeenMessages::new(Duration::from_secs(600), 4096);
    let mut attempt = 0u32;

    loop {
        let fetched = tokio::select! {
            _ = token.cancelled() => break,
            fetched = transport.fetch() => fetched,
        };

        let batch = match fetched {
            Ok(batch) => {
                attempt = 0;
                batch
            }
            Err(error) => {
                attempt += 1;
                let delay = retry_delay(attempt);
                tracing::warn!(
                    target = "burrow::source",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "message fetch failed, retrying"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        if batch.is_empty() {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(opts.poll_interval) => continue,
            }
        }

        for msg in batch {
            if !opts.allows(&msg) {
                tracing::info!(target = "burrow::source", sender = %msg.sender, chat_id = %msg.chat_id, "dropping message from sender outside allow-list");
                continue;
            }
            if !seen.insert_if_new(&msg.id, Instant::now()) {
                tracing::debug!(target = "burrow::source", id = %msg.id, "dropping duplicate message");
                continue;
            }
            tokio::select! {
                _ = token.cancelled() => return,
                sent = tx.send(msg) => {
                    if sent.is_err() {
                        tracing::debug!(target = "burrow::source", "control loop gone, stopping message source");
                        return;
                    }
                }
            }
        }
    }

    tracing::debug!(target = "burrow::source", "message source stopped");
}

/// Bounded TTL set of message ids already forwarded.
#[derive(Debug)]
struct SeenMessages {
    ttl: Duration,
    max_entries: usize,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl SeenMessages {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert_if_new(&mut self, id: &str, now: Instant) -> bool {
        while let Some((oldest, ts)) = self.order.front() {
            if now.duration_since(*ts) < self.ttl {
                break;
            }
            self.seen.remove(oldest);
            self.order.pop_front();
        }

        if self.seen.contains_key(id) {
            return false;
        }
        self.seen.insert(id.to_string(), now);
        self.order.push_back((id.to_string(), now));

        while self.order.len() > self.max_entries {
            if let Some((evicted, _)) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}
