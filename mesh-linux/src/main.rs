// Meshcall Linux daemon: signaling listener, presence prober, and contact management commands.

mod config;
mod handler;
mod listener;
mod node;
mod presence;
mod store;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use mesh_core::{Contact, Database, MeshCore, Notification, Persistence, Presence, PublicKey};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::listener::Listener;
use crate::node::{NoMedia, Node};
use crate::store::FileStore;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: mesh-linux [--config PATH] [COMMAND]

commands:
  run                              serve signaling (default)
  identity                         print this node's public key
  contacts                         list contacts
  add-contact NAME KEY [ADDR...]   add or replace a contact
  remove-contact KEY|NAME
  block KEY|NAME | unblock KEY|NAME
  block-unknown on|off             refuse callers that are not contacts
  set-name NAME                    name shown to peers

while running, SIGUSR1 clears the call history";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run,
    Version,
    Help,
    Identity,
    Contacts,
    AddContact {
        name: String,
        key: PublicKey,
        addresses: Vec<String>,
    },
    RemoveContact(ContactRef),
    Block(ContactRef),
    Unblock(ContactRef),
    BlockUnknown(bool),
    SetName(String),
}

/// A contact named on the command line, by key or by name.
#[derive(Debug, PartialEq, Eq)]
enum ContactRef {
    Key(PublicKey),
    Name(String),
}

impl ContactRef {
    fn resolve(&self, core: &MeshCore) -> anyhow::Result<PublicKey> {
        match self {
            ContactRef::Key(key) if core.contact(key).is_some() => Ok(*key),
            ContactRef::Key(key) => bail!("no contact {key}"),
            ContactRef::Name(name) => core
                .contact_by_name(name)
                .map(|c| *c.public_key())
                .with_context(|| format!("no contact named {name:?}")),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Args {
    config: Option<PathBuf>,
    command: Command,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut config = None;
    let mut rest = Vec::new();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                return Ok(Args {
                    config,
                    command: Command::Version,
                })
            }
            "--help" | "-h" => {
                return Ok(Args {
                    config,
                    command: Command::Help,
                })
            }
            "--config" | "-c" => match it.next() {
                Some(path) => config = Some(PathBuf::from(path)),
                None => bail!("--config needs a path"),
            },
            _ => rest.push(arg),
        }
    }

    let key = |s: Option<&String>| -> anyhow::Result<PublicKey> {
        let s = s.context("missing public key")?;
        let key: PublicKey = s.parse().with_context(|| format!("bad public key {s:?}"))?;
        key.agreement_key()
            .with_context(|| format!("{s} is not a valid identity"))?;
        Ok(key)
    };
    let target = |s: Option<&String>| -> anyhow::Result<ContactRef> {
        let s = s.context("missing contact key or name")?;
        match s.parse::<PublicKey>() {
            Ok(_) => key(Some(s)).map(ContactRef::Key),
            Err(_) => Ok(ContactRef::Name(s.clone())),
        }
    };
    let command = match rest.first().map(String::as_str) {
        None | Some("run") => Command::Run,
        Some("identity") => Command::Identity,
        Some("contacts") => Command::Contacts,
        Some("add-contact") => {
            let name = rest.get(1).context("missing contact name")?.clone();
            Command::AddContact {
                name,
                key: key(rest.get(2))?,
                addresses: rest.iter().skip(3).cloned().collect(),
            }
        }
        Some("remove-contact") => Command::RemoveContact(target(rest.get(1))?),
        Some("block") => Command::Block(target(rest.get(1))?),
        Some("unblock") => Command::Unblock(target(rest.get(1))?),
        Some("set-name") => Command::SetName(rest.get(1).context("missing name")?.clone()),
        Some("block-unknown") => match rest.get(1).map(String::as_str) {
            Some("on") => Command::BlockUnknown(true),
            Some("off") => Command::BlockUnknown(false),
            _ => bail!("block-unknown takes on or off"),
        },
        Some(other) => bail!("unknown command {other:?}\n{USAGE}"),
    };
    Ok(Args { config, command })
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    match args.command {
        Command::Version => {
            println!("mesh-linux {}", VERSION);
            return Ok(());
        }
        Command::Help => {
            println!("{USAGE}");
            return Ok(());
        }
        _ => {}
    }

    let cfg = config::load(args.config.as_deref())?;
    init_logging(&cfg.log_level);

    let passphrase = std::env::var("MESHCALL_PASSPHRASE").unwrap_or_default();
    let store = FileStore::new(&cfg.database_path);
    let db = match store
        .load(&passphrase)
        .with_context(|| format!("cannot open database {}", store.path().display()))?
    {
        Some(db) => db,
        None => {
            let db = Database::generate();
            store.store(&db, &passphrase)?;
            info!(path = %store.path().display(), key = %db.keypair().public_key(), "new identity generated");
            db
        }
    };

    let mut core = MeshCore::from_database(&db);
    drop(db);
    core.set_signaling_port(cfg.port);

    match args.command {
        Command::Run => run(cfg, core, store, passphrase),
        command => {
            manage(&mut core, command)?;
            store.store(&core.to_database()?, &passphrase)?;
            core.teardown();
            Ok(())
        }
    }
}

/// One-shot contact and settings commands.
fn manage(core: &mut MeshCore, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Identity => println!("{}", core.public_key()?),
        Command::Contacts => {
            for c in core.contacts() {
                println!(
                    "{}  {}  {}{}",
                    c.public_key(),
                    if c.name.is_empty() { "-" } else { c.name.as_str() },
                    c.addresses.join(","),
                    if c.blocked { "  (blocked)" } else { "" }
                );
            }
        }
        Command::AddContact {
            name,
            key,
            addresses,
        } => {
            if key == core.public_key()? {
                bail!("cannot add own identity as a contact");
            }
            let mut contact = Contact::new(name, key, addresses);
            if let Some(old) = core.contact(&key) {
                contact.blocked = old.blocked;
                contact.last_working = old.last_working;
            }
            if core.add_contact(contact) {
                println!("updated {key}");
            } else {
                println!("added {key}");
            }
        }
        Command::RemoveContact(target) => {
            let key = target.resolve(core)?;
            core.remove_contact(&key);
        }
        Command::Block(target) => {
            let key = target.resolve(core)?;
            core.set_blocked(&key, true);
        }
        Command::Unblock(target) => {
            let key = target.resolve(core)?;
            core.set_blocked(&key, false);
        }
        Command::BlockUnknown(on) => core.set_block_unknown(on),
        Command::SetName(name) => core.set_name(name),
        Command::Run | Command::Version | Command::Help => {}
    }
    Ok(())
}

fn run(cfg: Config, core: MeshCore, store: FileStore, passphrase: String) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listen_addr = cfg.listen_addr();
        let listener = match Listener::bind(&listen_addr, cfg.max_connections).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "startup failed");
                return Err(anyhow::Error::from(e));
            }
        };
        let node = Node::new(core, Arc::new(NoMedia), cfg.timeouts());
        let key = node.core().lock().await.public_key()?;
        info!(
            addr = %listener.local_addr()?,
            key = %key,
            max_connections = cfg.max_connections,
            "listening"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let notifications = node.subscribe();
        let watcher = tokio::spawn(watch_notifications(
            node.clone(),
            notifications,
            stop_rx.clone(),
        ));
        let prober = tokio::spawn(presence::run_prober(
            node.clone(),
            cfg.probe_interval(),
            stop_rx.clone(),
        ));
        let history = tokio::spawn(clear_history_on_signal(node.clone(), stop_rx.clone()));
        let serving = tokio::spawn(listener.run(node.clone(), stop_rx));

        shutdown_signal().await?;
        info!("shutdown requested");
        let _ = stop_tx.send(true);
        let _ = prober.await;
        if let Err(e) = serving.await {
            warn!(error = %e, "listener task failed");
        }
        let _ = watcher.await;
        let _ = history.await;

        let db = node.core().lock().await.to_database()?;
        store
            .store(&db, &passphrase)
            .with_context(|| format!("cannot store database {}", store.path().display()))?;
        drop(db);
        node.teardown().await;
        Ok::<_, anyhow::Error>(())
    })
}

/// Without a media layer every incoming call goes through `accept_call`, which declines it.
/// Call events are logged as they are recorded.
async fn watch_notifications(
    node: Node,
    mut notifications: broadcast::Receiver<Notification>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            _ = stop.changed() => return,
            n = notifications.recv() => n,
        };
        match received {
            Ok(Notification::IncomingCall(contact)) => {
                info!(peer = %contact.public_key(), name = %contact.name, "incoming call");
                let call = node.core().lock().await.current_call().map(|s| s.id);
                if let Some(call) = call {
                    if let Err(e) = node.accept_call(call).await {
                        info!(call = %call, reason = %e, "call not answered");
                    }
                }
            }
            Ok(Notification::EventListChanged) => {
                if let Some(event) = node.events().await.last() {
                    info!(peer = %event.public_key, address = ?event.address, kind = ?event.kind, "call event");
                }
            }
            Ok(Notification::CallDeclined) => info!("call ended by remote"),
            Ok(Notification::RemoteDisconnected(connection)) => {
                debug!(connection = %connection, "remote disconnected")
            }
            Ok(Notification::ContactListChanged) => {
                let contacts = node.contacts().await;
                let online = contacts
                    .iter()
                    .filter(|c| c.presence == Presence::Online)
                    .count();
                debug!(online, total = contacts.len(), "contact list changed");
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "notification watcher lagging")
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// SIGUSR1 clears the in-memory call history.
#[cfg(unix)]
async fn clear_history_on_signal(node: Node, mut stop: watch::Receiver<bool>) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut usr1 = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot install SIGUSR1 handler");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            received = usr1.recv() => {
                if received.is_none() {
                    return;
                }
                node.clear_events().await;
                info!("call history cleared");
            }
        }
    }
}

#[cfg(not(unix))]
async fn clear_history_on_signal(_node: Node, mut stop: watch::Receiver<bool>) {
    let _ = stop.changed().await;
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{Keypair, Settings};

    fn args(list: &[&str]) -> anyhow::Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn default_is_run() {
        assert_eq!(
            args(&[]).unwrap(),
            Args {
                config: None,
                command: Command::Run
            }
        );
        let a = args(&["--config", "/tmp/m.toml", "run"]).unwrap();
        assert_eq!(a.config, Some(PathBuf::from("/tmp/m.toml")));
        assert_eq!(a.command, Command::Run);
    }

    #[test]
    fn version_flag_wins() {
        assert_eq!(args(&["contacts", "-V"]).unwrap().command, Command::Version);
    }

    #[test]
    fn add_contact_with_addresses() {
        let key = *Keypair::generate().public_key();
        let hex = key.to_hex();
        let a = args(&["add-contact", "alice", &hex, "10.0.0.2", "alice.lan:10001"]).unwrap();
        assert_eq!(
            a.command,
            Command::AddContact {
                name: "alice".into(),
                key,
                addresses: vec!["10.0.0.2".into(), "alice.lan:10001".into()],
            }
        );
    }

    #[test]
    fn contact_by_key_or_name() {
        let key = *Keypair::generate().public_key();
        assert_eq!(
            args(&["block", &key.to_hex()]).unwrap().command,
            Command::Block(ContactRef::Key(key))
        );
        assert_eq!(
            args(&["remove-contact", "alice"]).unwrap().command,
            Command::RemoveContact(ContactRef::Name("alice".into()))
        );
        assert_eq!(
            args(&["set-name", "desk"]).unwrap().command,
            Command::SetName("desk".into())
        );
    }

    #[test]
    fn bad_arguments() {
        assert!(args(&["add-contact", "alice"]).is_err());
        assert!(args(&["block"]).is_err());
        assert!(args(&["set-name"]).is_err());
        assert!(args(&["block-unknown", "maybe"]).is_err());
        assert!(args(&["--config"]).is_err());
        assert!(args(&["dance"]).is_err());
    }

    #[test]
    fn manage_contacts() {
        let me = Keypair::generate();
        let mine = *me.public_key();
        let mut core = MeshCore::new(me, Settings::default(), vec![]);
        let key = *Keypair::generate().public_key();
        manage(
            &mut core,
            Command::AddContact {
                name: "bob".into(),
                key,
                addresses: vec![],
            },
        )
        .unwrap();
        manage(&mut core, Command::Block(ContactRef::Name("bob".into()))).unwrap();
        assert!(core.contact(&key).unwrap().blocked);
        // Re-adding keeps the blocked flag.
        manage(
            &mut core,
            Command::AddContact {
                name: "bobby".into(),
                key,
                addresses: vec!["10.1.1.1".into()],
            },
        )
        .unwrap();
        let bob = core.contact(&key).unwrap();
        assert!(bob.blocked);
        assert_eq!(bob.name, "bobby");
        assert!(manage(
            &mut core,
            Command::AddContact {
                name: "me".into(),
                key: mine,
                addresses: vec![],
            }
        )
        .is_err());
        manage(&mut core, Command::BlockUnknown(true)).unwrap();
        assert!(core.settings().block_unknown);
        assert!(manage(&mut core, Command::Unblock(ContactRef::Name("bob".into()))).is_err());
        manage(&mut core, Command::RemoveContact(ContactRef::Key(key))).unwrap();
        assert!(manage(&mut core, Command::Unblock(ContactRef::Key(key))).is_err());
        manage(&mut core, Command::SetName("desk".into())).unwrap();
        assert_eq!(core.settings().name, "desk");
    }
}
