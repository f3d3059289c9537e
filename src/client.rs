//! # Chat Client Wiring
//!
//! Connects the session state to the transport and the terminal:
//!
//! - three inbound subscriptions (channel posts, own DM inbox, presence),
//!   each running as its own task behind the validation gate
//! - a self-rescheduling heartbeat task (sleep-then-send, never
//!   fixed-rate, so slow emission cannot overlap itself)
//! - a single rendering owner consuming [`RenderEvent`]s from a channel —
//!   no task prints while holding the state lock
//! - the foreground input loop (commands and message composition)
//!
//! The transport collaborator is required to suppress echo of our own
//! publications and may deliver at least once; the seen-token set absorbs
//! redelivery.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::claims::{encode_signed, ClaimBody, Claims};
use crate::identity::{now_secs, parse_credentials, Keypair};
use crate::issuer::canonical_name;
use crate::permissions::{dm_subject, online_subject, post_subject, posts_wildcard};
use crate::state::{
    DmOutcome, PostOutcome, SessionConfig, SessionState, Target, HEARTBEAT_FRESHNESS_SECS,
    HEARTBEAT_PERIOD,
};
use crate::validate::{validate_claim, ClaimError};

type SharedState = Arc<Mutex<SessionState>>;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server: String,
    pub creds_path: PathBuf,
    /// Optional display-name override; canonicalized like issued names.
    pub name_override: Option<String>,
    /// Enable peer eviction after this many seconds without a heartbeat.
    pub peer_ttl_secs: Option<u64>,
}

/// Everything the rendering owner knows how to draw.
#[derive(Debug)]
enum RenderEvent {
    Message { at: u64, name: String, text: String },
    View { title: String, lines: Vec<String> },
    System(String),
    Unread(String),
}

/// Run the chat client until the user quits or the credential expires.
pub async fn run(config: ClientConfig) -> Result<()> {
    // Load and check our own credential before touching the network.
    let contents = std::fs::read_to_string(&config.creds_path).with_context(|| {
        format!("could not load user credentials {}", config.creds_path.display())
    })?;
    let (token, keypair) = parse_credentials(&contents).context("could not parse credentials")?;
    let me = validate_claim(token.as_bytes())
        .map_err(|e| anyhow::anyhow!("credentials rejected: {e}"))?
        .claims;

    let ClaimBody::User { .. } = &me.body else {
        bail!("credentials do not contain an identity token");
    };
    if me.sub != keypair.identity().to_hex() {
        bail!("credential seed does not match the identity token");
    }

    let display_name = match &config.name_override {
        Some(over) => canonical_name(over).context("invalid name override")?,
        None => me.name.clone(),
    };

    info!(server = %config.server, "connecting to messaging system");
    let client = async_nats::ConnectOptions::new()
        .name("Palaver Chat")
        // We do not want to hear our own publications.
        .no_echo()
        .event_callback(|event| async move {
            match event {
                async_nats::Event::Disconnected => warn!("transport disconnected, retrying"),
                async_nats::Event::Connected => info!("transport reconnected"),
                other => debug!(event = ?other, "transport event"),
            }
        })
        .connect(config.server.as_str())
        .await
        .context("could not connect to messaging system")?;

    let session_config = SessionConfig {
        peer_ttl: config.peer_ttl_secs.map(Duration::from_secs),
        ..SessionConfig::default()
    };
    let state: SharedState = Arc::new(Mutex::new(SessionState::new(
        keypair.identity(),
        &display_name,
        session_config,
    )));
    let keypair = Arc::new(keypair);

    let (render_tx, render_rx) = mpsc::unbounded_channel();
    tokio::spawn(render_loop(render_rx));

    banner(&state, &render_tx);

    // Inbound subscriptions. Each callback validates, mutates under the
    // lock, snapshots, releases, then renders or publishes.
    let posts = client
        .subscribe(posts_wildcard())
        .await
        .context("could not subscribe to channel posts")?;
    let dms = client
        .subscribe(dm_subject(&keypair.identity()))
        .await
        .context("could not subscribe to direct messages")?;
    let presence = client
        .subscribe(online_subject())
        .await
        .context("could not subscribe to presence")?;

    tokio::spawn(post_loop(posts, Arc::clone(&state), render_tx.clone()));
    tokio::spawn(dm_loop(dms, Arc::clone(&state), render_tx.clone()));
    tokio::spawn(presence_loop(
        presence,
        Arc::clone(&state),
        Arc::clone(&keypair),
        client.clone(),
        render_tx.clone(),
    ));
    tokio::spawn(heartbeat_loop(
        Arc::clone(&state),
        Arc::clone(&keypair),
        client.clone(),
        render_tx.clone(),
    ));

    // Terminate when our own credential expires mid-session.
    if let Some(exp) = me.exp {
        tokio::spawn(async move {
            let remaining = exp.saturating_sub(now_secs());
            tokio::time::sleep(Duration::from_secs(remaining)).await;
            error!("credentials have expired");
            std::process::exit(1);
        });
    }

    input_loop(state, keypair, client, render_tx).await
}

// ============================================================================
// Rendering owner
// ============================================================================

fn hhmm(at: u64) -> String {
    format!("{:02}:{:02}", (at / 3600) % 24, (at / 60) % 60)
}

fn post_line(at: u64, name: &str, text: &str) -> String {
    format!("[{}] {:<10} {}", hhmm(at), format!("<{name}>"), text)
}

/// The single rendering owner: every task sends here instead of printing.
async fn render_loop(mut events: mpsc::UnboundedReceiver<RenderEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            RenderEvent::Message { at, name, text } => {
                println!("{}", post_line(at, &name, &text));
            }
            RenderEvent::View { title, lines } => {
                println!("\x1b[1m--- {title} ---\x1b[0m");
                for line in lines {
                    println!("{line}");
                }
            }
            RenderEvent::System(text) => {
                println!("\x1b[2m* {text}\x1b[0m");
            }
            RenderEvent::Unread(name) => {
                println!("\x1b[33m* new direct message from {name}\x1b[0m");
            }
        }
    }
}

fn banner(state: &SharedState, render_tx: &mpsc::UnboundedSender<RenderEvent>) {
    let (name, me, channels) = {
        let state = state.lock();
        (
            state.name().to_string(),
            state.me(),
            state.channels().join(", "),
        )
    };
    let _ = render_tx.send(RenderEvent::System(format!(
        "you are {name} ({me}); channels: {channels}; commands: /join /dm /who /channels /quit"
    )));
}

fn log_rejected(err: &ClaimError, what: &str) {
    warn!(error = %err, "rejected {what}");
}

// ============================================================================
// Inbound claim loops
// ============================================================================

async fn post_loop(
    mut sub: async_nats::Subscriber,
    state: SharedState,
    render_tx: mpsc::UnboundedSender<RenderEvent>,
) {
    while let Some(msg) = sub.next().await {
        let validated = match validate_claim(&msg.payload) {
            Ok(v) => v,
            Err(err) => {
                log_rejected(&err, "channel post");
                continue;
            }
        };
        for warning in &validated.warnings {
            debug!(issue = %warning.description, "post validation warning");
        }

        let (outcome, name) = {
            let mut state = state.lock();
            let outcome = state.apply_channel_post(&validated);
            let name = state.display_name_for(&validated.claims);
            (outcome, name)
        };

        match outcome {
            PostOutcome::Appended { visible: true, .. } => {
                if let ClaimBody::Post { text } = &validated.claims.body {
                    let _ = render_tx.send(RenderEvent::Message {
                        at: validated.claims.iat,
                        name,
                        text: text.clone(),
                    });
                }
            }
            PostOutcome::Appended { visible: false, channel } => {
                trace!(channel = %channel, "post stored for unselected channel");
            }
            PostOutcome::Duplicate => trace!("duplicate post suppressed"),
            PostOutcome::Ignored => trace!("post for unknown channel ignored"),
        }
    }
}

async fn dm_loop(
    mut sub: async_nats::Subscriber,
    state: SharedState,
    render_tx: mpsc::UnboundedSender<RenderEvent>,
) {
    while let Some(msg) = sub.next().await {
        let validated = match validate_claim(&msg.payload) {
            Ok(v) => v,
            Err(err) => {
                log_rejected(&err, "direct message");
                continue;
            }
        };

        let outcome = state.lock().apply_direct_message(&validated);
        match outcome {
            DmOutcome::Appended { from, visible } => {
                if visible {
                    if let ClaimBody::Post { text } = &validated.claims.body {
                        let _ = render_tx.send(RenderEvent::Message {
                            at: validated.claims.iat,
                            name: from,
                            text: text.clone(),
                        });
                    }
                } else {
                    let _ = render_tx.send(RenderEvent::Unread(from));
                }
            }
            // Unsolicited DMs from unknown identities are policy drops,
            // not errors.
            DmOutcome::UnknownSender => trace!("direct message from unknown sender dropped"),
            DmOutcome::Duplicate => trace!("duplicate direct message suppressed"),
            DmOutcome::Ignored => {}
        }
    }
}

async fn presence_loop(
    mut sub: async_nats::Subscriber,
    state: SharedState,
    keypair: Arc<Keypair>,
    client: async_nats::Client,
    render_tx: mpsc::UnboundedSender<RenderEvent>,
) {
    while let Some(msg) = sub.next().await {
        let validated = match validate_claim(&msg.payload) {
            Ok(v) => v,
            Err(err) => {
                log_rejected(&err, "presence update");
                continue;
            }
        };

        let (outcome, name) = {
            let mut state = state.lock();
            let outcome = state.apply_heartbeat(&validated);
            (outcome, state.name().to_string())
        };

        if let Some(joined) = outcome.joined {
            let _ = render_tx.send(RenderEvent::System(format!("{joined} is online")));
        }
        if outcome.rebroadcast {
            // The newcomer does not know us yet; answer out-of-cycle.
            publish_heartbeat(&client, &keypair, &name, false).await;
        }
    }
}

/// Broadcast our heartbeat immediately (flagged as a newcomer), then on a
/// fixed period. Self-rescheduling: the next sleep starts only after the
/// previous emission finished.
async fn heartbeat_loop(
    state: SharedState,
    keypair: Arc<Keypair>,
    client: async_nats::Client,
    render_tx: mpsc::UnboundedSender<RenderEvent>,
) {
    let name = state.lock().name().to_string();
    publish_heartbeat(&client, &keypair, &name, true).await;

    loop {
        tokio::time::sleep(HEARTBEAT_PERIOD).await;

        let evicted = state.lock().evict_stale_peers();
        for name in evicted {
            let _ = render_tx.send(RenderEvent::System(format!("{name} went offline")));
        }

        publish_heartbeat(&client, &keypair, &name, false).await;
    }
}

async fn publish_heartbeat(
    client: &async_nats::Client,
    keypair: &Keypair,
    name: &str,
    newcomer: bool,
) {
    let claims = Claims::heartbeat(keypair.identity(), name, HEARTBEAT_FRESHNESS_SECS, newcomer);
    let encoded = match encode_signed(&claims, keypair) {
        Ok(encoded) => encoded,
        Err(err) => {
            error!(error = %err, "could not sign heartbeat");
            return;
        }
    };
    if let Err(err) = client.publish(online_subject(), Bytes::from(encoded)).await {
        warn!(error = %err, "could not publish heartbeat");
    }
}

// ============================================================================
// Input loop
// ============================================================================

async fn input_loop(
    state: SharedState,
    keypair: Arc<Keypair>,
    client: async_nats::Client,
    render_tx: mpsc::UnboundedSender<RenderEvent>,
) -> Result<()> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("/join ") {
            show_channel(&state, &render_tx, rest.trim());
        } else if let Some(rest) = line.strip_prefix("/dm ") {
            show_peer(&state, &render_tx, rest.trim());
        } else if line == "/who" {
            show_who(&state, &render_tx);
        } else if line == "/channels" {
            let channels = state.lock().channels().join(", ");
            let _ = render_tx.send(RenderEvent::System(format!("channels: {channels}")));
        } else if line == "/quit" {
            break;
        } else if line.starts_with('/') {
            let _ = render_tx.send(RenderEvent::System(format!("unknown command {line}")));
        } else {
            send_post(&state, &keypair, &client, &render_tx, line).await;
        }
    }

    // Closing is immediate; the client has no drain step.
    info!("exiting");
    Ok(())
}

fn show_channel(
    state: &SharedState,
    render_tx: &mpsc::UnboundedSender<RenderEvent>,
    name: &str,
) {
    let view = {
        let mut state = state.lock();
        state.select_channel(name).map(|entries| {
            entries
                .iter()
                .map(|e| post_line(e.at, &state.render_name(e), &e.text))
                .collect::<Vec<_>>()
        })
    };
    match view {
        Some(lines) => {
            let _ = render_tx.send(RenderEvent::View {
                title: format!("#{name}"),
                lines,
            });
        }
        None => {
            let _ = render_tx.send(RenderEvent::System(format!("no such channel {name}")));
        }
    }
}

fn show_peer(state: &SharedState, render_tx: &mpsc::UnboundedSender<RenderEvent>, name: &str) {
    let view = {
        let mut state = state.lock();
        state.select_peer(name).map(|entries| {
            entries
                .iter()
                .map(|e| post_line(e.at, &state.render_name(e), &e.text))
                .collect::<Vec<_>>()
        })
    };
    match view {
        Some(lines) => {
            let _ = render_tx.send(RenderEvent::View {
                title: format!("@{name}"),
                lines,
            });
        }
        None => {
            let _ = render_tx.send(RenderEvent::System(format!("no such user {name}")));
        }
    }
}

fn show_who(state: &SharedState, render_tx: &mpsc::UnboundedSender<RenderEvent>) {
    let lines: Vec<String> = state
        .lock()
        .who()
        .into_iter()
        .map(|(name, ago, unread)| {
            let marker = if unread { " *" } else { "" };
            format!("{name} (seen {ago}s ago){marker}")
        })
        .collect();
    let _ = render_tx.send(RenderEvent::View {
        title: "online".to_string(),
        lines,
    });
}

async fn send_post(
    state: &SharedState,
    keypair: &Keypair,
    client: &async_nats::Client,
    render_tx: &mpsc::UnboundedSender<RenderEvent>,
    text: &str,
) {
    // Compose and locally append under the lock; sign and publish after.
    let composed = {
        let mut state = state.lock();
        let target = state.current_target();
        let name = state.name().to_string();
        target.map(|target| {
            let (claim_subject, wire_subject) = match &target {
                Target::Channel(channel) => (channel.clone(), post_subject(channel)),
                Target::Peer(key) => (key.to_hex(), dm_subject(key)),
            };
            let claims = Claims::post(state.me(), &name, &claim_subject, text);
            state.append_own_post(&claims);
            (claims, wire_subject, name)
        })
    };

    let Some((claims, wire_subject, name)) = composed else {
        let _ = render_tx.send(RenderEvent::System("nothing selected".to_string()));
        return;
    };

    let encoded = match encode_signed(&claims, keypair) {
        Ok(encoded) => encoded,
        Err(err) => {
            error!(error = %err, "could not sign post");
            return;
        }
    };
    if let Err(err) = client.publish(wire_subject, Bytes::from(encoded)).await {
        warn!(error = %err, "could not publish post");
    }

    let _ = render_tx.send(RenderEvent::Message {
        at: claims.iat,
        name,
        text: text.to_string(),
    });
}
