// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use dc_blockquick::BlockQuick;
use dc_edge::httpd::{HttpProxy, ProxyConfig};
use dc_edge::pool::{DataPool, PublishedPort};
use dc_edge::socks::{SocksConfig, SocksServer};
use dc_edge::transaction::Transaction;
use dc_edge::watcher::{watch_account, MAX_POLLS, POLL_INTERVAL};
use dc_edge::{
    contract, BridgeOpts, EdgeConfig, EdgeError, PortMode, RpcClient, StoreWindowSink,
};
use dc_store::{ClientStore, KEY_FLEET, KEY_PRIVATE, KEY_WINDOW};
use dc_types::Address;

/// Grace-Periode zwischen SIGINT und hartem Teardown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_GAS_PRICE: u64 = 10_000_000_000;
const DEFAULT_GAS_LIMIT: u64 = 300_000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, Parser)]
#[command(
    name = "diode-node",
    version,
    about = "Diode network client",
    disable_help_subcommand = true
)]
struct NodeOpts {
    /// Verzeichnis des lokalen Stores (Schlüssel, Fenster, Konfiguration)
    #[arg(long, default_value = "./diode-data")]
    dbpath: String,
    /// Gateway-Kandidaten host[:port], komma-separiert (Default: Prenet)
    #[arg(long, value_delimiter = ',')]
    gateways: Vec<String>,
    /// Fleet-Vertragsadresse (Override zum Store)
    #[arg(long)]
    fleet: Option<String>,
    /// fsync für Store-Schreibvorgänge
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    fsync: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// SOCKS5-Proxy für Browser und andere Apps starten
    Socksd(SocksdArgs),
    /// Öffentlichen HTTP(S)-Proxy starten (das "diode.link"-Frontend)
    Httpd(HttpdArgs),
    /// Lokale TCP-Ports ins Overlay veröffentlichen
    Publish(PublishArgs),
    /// Variablen im lokalen Config-Store verwalten
    Config(ConfigArgs),
    /// BNS-Namen registrieren oder auflösen
    Bns(BnsArgs),
    /// Credentials zurücksetzen. WARNUNG: löscht den aktuellen Account!
    Reset(ResetArgs),
    /// Konsenszeit der Kette anzeigen
    Time,
    /// Client auf die neueste Version aktualisieren
    Update,
}

#[derive(Debug, Clone, Args)]
struct SocksdArgs {
    /// Host, auf dem der SOCKS-Server lauscht
    #[arg(long, default_value = "127.0.0.1")]
    socksd_host: String,
    /// Port des SOCKS-Servers
    #[arg(long, default_value_t = 1080)]
    socksd_port: u16,
    /// Auflösung von Web2-Adressen: "localhost", ein Host oder leer (aus)
    #[arg(long, default_value = "localhost")]
    fallback: String,
    /// Modus ausgehender Port-Streams: public | protected | private
    #[arg(long, default_value = "private")]
    mode: String,
    /// Nur diese Zieladressen zulassen (0x…, komma-separiert)
    #[arg(long, value_delimiter = ',')]
    allow: Vec<String>,
    /// Diese Zieladressen sperren (0x…, komma-separiert)
    #[arg(long, value_delimiter = ',')]
    deny: Vec<String>,
}

#[derive(Debug, Clone, Args)]
struct HttpdArgs {
    /// Host des HTTP-Listeners
    #[arg(long, default_value = "127.0.0.1")]
    httpd_host: String,
    /// Port des HTTP-Listeners
    #[arg(long, default_value_t = 80)]
    httpd_port: u16,
    /// Host des HTTPS-Listeners
    #[arg(long, default_value = "127.0.0.1")]
    httpsd_host: String,
    /// Port des HTTPS-Listeners
    #[arg(long, default_value_t = 443)]
    httpsd_port: u16,
    /// Zertifikat (PEM) für den HTTPS-Listener
    #[arg(long, default_value = "./priv/cert.pem")]
    certpath: String,
    /// Privater Schlüssel (PEM) für den HTTPS-Listener
    #[arg(long, default_value = "./priv/priv.pem")]
    privpath: String,
    /// HTTPS-Listener aktivieren
    #[arg(long, default_value_t = false)]
    secure: bool,
    /// HTTP-Anfragen per 301 auf HTTPS umleiten
    #[arg(long, default_value_t = false)]
    allow_redirect: bool,
}

#[derive(Debug, Clone, Args)]
struct PublishArgs {
    /// Öffentlicher Port local:remote (mehrfach angebbar)
    #[arg(long)]
    public: Vec<String>,
    /// Geschützter Port local:remote (nur Fleet-Mitglieder)
    #[arg(long)]
    protected: Vec<String>,
    /// Privater Port local:remote,0xaddr,… (nur gelistete Adressen)
    #[arg(long)]
    private: Vec<String>,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    /// Alle gespeicherten Schlüssel listen
    #[arg(long, default_value_t = false)]
    list: bool,
    /// Variable setzen: key=value (value darf 0x…-Hex sein)
    #[arg(long)]
    set: Vec<String>,
    /// Variable löschen
    #[arg(long)]
    delete: Vec<String>,
    /// Private Schlüssel anzeigen bzw. überschreiben lassen
    #[arg(long = "unsafe", default_value_t = false)]
    unsafe_edit: bool,
}

#[derive(Debug, Clone, Args)]
struct BnsArgs {
    /// Neuen Namen registrieren: name=0x…
    #[arg(long)]
    register: Option<String>,
    /// Namen auflösen
    #[arg(long)]
    lookup: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct ResetArgs {
    /// Ohne dieses Flag wird nichts gelöscht
    #[arg(long, default_value_t = false)]
    force: bool,
}

fn main() {
    init_tracing();
    let opts = NodeOpts::parse();
    let code = match run(&opts) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            match e.downcast_ref::<EdgeError>() {
                Some(edge) if edge.is_startup_fatal() => 129,
                _ => 1,
            }
        }
    };
    std::process::exit(code);
}

fn run(opts: &NodeOpts) -> Result<()> {
    match &opts.command {
        Command::Socksd(args) => run_socksd(opts, args),
        Command::Httpd(args) => run_httpd(opts, args),
        Command::Publish(args) => run_publish(opts, args),
        Command::Config(args) => run_config(opts, args),
        Command::Bns(args) => run_bns(opts, args),
        Command::Reset(args) => run_reset(opts, args),
        Command::Time => run_time(opts),
        Command::Update => run_update(),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("failed to build tokio runtime: {e}"))
}

struct Ctx {
    cfg: EdgeConfig,
    store: Arc<ClientStore>,
    pool: Arc<DataPool>,
    verifier: Arc<BlockQuick>,
}

fn build_ctx(opts: &NodeOpts) -> Result<Ctx, EdgeError> {
    let store = Arc::new(ClientStore::open(&opts.dbpath, opts.fsync)?);
    let mut cfg = EdgeConfig::default();
    if !opts.gateways.is_empty() {
        cfg.gateways = opts.gateways.clone();
    }
    cfg.fleet = match &opts.fleet {
        Some(raw) => Address::parse_hex(raw).map_err(|e| EdgeError::Config(e.to_string()))?,
        None => match store.fleet()? {
            Some(raw) => Address(raw),
            None => cfg.fleet,
        },
    };
    let sink = Arc::new(StoreWindowSink(store.clone()));
    let verifier = Arc::new(BlockQuick::new(cfg.window_size, Some(sink)));
    if let Some(raw) = store.get(KEY_WINDOW)? {
        if let Err(e) = verifier.restore(&raw) {
            warn!(error = %e, "stored window unusable, will bootstrap");
        }
    }
    Ok(Ctx {
        cfg,
        store,
        pool: DataPool::new(),
        verifier,
    })
}

/// SIGINT-Kanal; der Sender lebt im Hintergrund-Task weiter.
fn signal_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        let _ = tx.send(true);
        std::future::pending::<()>().await;
    });
    rx
}

/// Rennt alle Gateway-Kandidaten; die erste vollständig validierte Session
/// gewinnt, Verlierer werden geschlossen. AccessDenied ist nicht
/// wiederholbar und bricht sofort ab.
async fn connect_any(ctx: &Ctx) -> Result<RpcClient, EdgeError> {
    let gateways = ctx.cfg.gateways.clone();
    if gateways.is_empty() {
        return Err(EdgeError::Config("no gateways configured".to_string()));
    }
    let (tx, mut rx) = tokio::sync::mpsc::channel(gateways.len());
    let candidates = gateways.len();
    for host in gateways {
        let tx = tx.clone();
        let cfg = ctx.cfg.clone();
        let pool = ctx.pool.clone();
        let verifier = ctx.verifier.clone();
        let store = ctx.store.clone();
        tokio::spawn(async move {
            match RpcClient::connect(&host, cfg, pool, verifier, store).await {
                Ok(client) => {
                    // Gewinner steht evtl. schon fest; dann sauber schließen
                    if tx.send(Ok(client.clone())).await.is_err() {
                        client.close();
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err((host, e))).await;
                }
            }
        });
    }
    drop(tx);
    let mut last = EdgeError::Connect("all gateways failed".to_string());
    for _ in 0..candidates {
        match rx.recv().await {
            Some(Ok(client)) => {
                info!(host = %client.host(), "gateway selected");
                return Ok(client);
            }
            Some(Err((host, e))) => {
                warn!(host = %host, error = %e, "gateway candidate failed");
                if matches!(e, EdgeError::AccessDenied(_)) {
                    return Err(e);
                }
                last = e;
            }
            None => break,
        }
    }
    Err(last)
}

async fn session_lost(client: RpcClient) {
    while !client.is_closed() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Supervisor-Schleife: Session wählen, Dienst fahren, bei Session-Verlust
/// neu wählen; Shutdown mit Grace-Periode.
async fn supervise<F, Fut>(ctx: &Ctx, shutdown: watch::Receiver<bool>, serve: F) -> Result<()>
where
    F: Fn(RpcClient, watch::Receiver<bool>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut had_session = false;
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        let client = match connect_any(ctx).await {
            Ok(client) => client,
            Err(e) => {
                let fatal = e.is_startup_fatal() || matches!(e, EdgeError::AccessDenied(_));
                if fatal || !had_session {
                    return Err(e.into());
                }
                warn!(error = %e, "reselect failed, retrying");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };
        had_session = true;
        let serving = serve(client.clone(), shutdown.clone());
        tokio::select! {
            res = serving => {
                if *shutdown.borrow() {
                    info!(grace = ?SHUTDOWN_GRACE, "draining active bridges");
                    tokio::time::sleep(SHUTDOWN_GRACE).await;
                }
                client.close();
                return res;
            }
            _ = session_lost(client.clone()) => {
                warn!(host = %client.host(), "gateway session lost, reselecting");
                continue;
            }
        }
    }
}

fn parse_addr_list(raw: &[String]) -> Result<Vec<Address>, EdgeError> {
    raw.iter()
        .map(|s| Address::parse_hex(s).map_err(|e| EdgeError::Config(e.to_string())))
        .collect()
}

fn run_socksd(opts: &NodeOpts, args: &SocksdArgs) -> Result<()> {
    let socks_cfg = SocksConfig {
        host: args.socksd_host.clone(),
        port: args.socksd_port,
        fallback: args.fallback.clone(),
        mode: args.mode.parse()?,
        allow_list: parse_addr_list(&args.allow)?,
        deny_list: parse_addr_list(&args.deny)?,
    };
    let rt = runtime()?;
    rt.block_on(async {
        let ctx = build_ctx(opts)?;
        let bridge_opts = BridgeOpts {
            chunk_size: ctx.cfg.chunk_size,
            idle_timeout: ctx.cfg.idle_timeout,
        };
        let shutdown = signal_channel();
        supervise(&ctx, shutdown, move |client, shutdown| {
            let socks_cfg = socks_cfg.clone();
            async move {
                let server = SocksServer::new(Arc::new(client), socks_cfg, bridge_opts);
                let listener = server.bind().await?;
                server.run(listener, shutdown).await?;
                Ok(())
            }
        })
        .await
    })
}

fn run_httpd(opts: &NodeOpts, args: &HttpdArgs) -> Result<()> {
    let proxy_cfg = ProxyConfig {
        httpd_host: args.httpd_host.clone(),
        httpd_port: args.httpd_port,
        httpsd_host: args.httpsd_host.clone(),
        httpsd_port: args.httpsd_port,
        certpath: args.certpath.clone(),
        privpath: args.privpath.clone(),
        secure: args.secure,
        allow_redirect: args.allow_redirect,
        mode: PortMode::Public,
    };
    let rt = runtime()?;
    rt.block_on(async {
        let ctx = build_ctx(opts)?;
        let bridge_opts = BridgeOpts {
            chunk_size: ctx.cfg.chunk_size,
            idle_timeout: ctx.cfg.idle_timeout,
        };
        let shutdown = signal_channel();
        supervise(&ctx, shutdown, move |client, shutdown| {
            let proxy_cfg = proxy_cfg.clone();
            async move {
                let proxy = HttpProxy::new(Arc::new(client), proxy_cfg.clone(), bridge_opts);
                if proxy_cfg.secure {
                    tokio::try_join!(
                        proxy.clone().run_http(shutdown.clone()),
                        proxy.clone().run_https(shutdown)
                    )?;
                } else {
                    proxy.run_http(shutdown).await?;
                }
                Ok(())
            }
        })
        .await
    })
}

/// "local:remote" bzw. "local:remote,0xaddr,…" (nur private).
fn parse_publish(spec: &str, mode: PortMode) -> Result<PublishedPort, EdgeError> {
    let bad = |what: &str| EdgeError::Config(format!("publish {spec}: {what}"));
    let mut parts = spec.split(',');
    let mapping = parts.next().ok_or_else(|| bad("empty"))?;
    let (local, remote) = mapping
        .split_once(':')
        .ok_or_else(|| bad("expected local:remote"))?;
    let local_port: u16 = local.parse().map_err(|_| bad("local port"))?;
    let remote_port: u16 = remote.parse().map_err(|_| bad("remote port"))?;
    let access_list: Vec<Address> = parts
        .map(|s| Address::parse_hex(s).map_err(|e| bad(&e.to_string())))
        .collect::<Result<_, _>>()?;
    if mode == PortMode::Private && access_list.is_empty() {
        return Err(bad("private publish needs at least one address"));
    }
    if mode != PortMode::Private && !access_list.is_empty() {
        return Err(bad("access list only valid for private"));
    }
    Ok(PublishedPort {
        local_port,
        remote_port,
        mode,
        access_list,
    })
}

fn run_publish(opts: &NodeOpts, args: &PublishArgs) -> Result<()> {
    let rt = runtime()?;
    rt.block_on(async {
        let ctx = build_ctx(opts)?;
        for spec in &args.public {
            ctx.pool.publish(parse_publish(spec, PortMode::Public)?)?;
        }
        for spec in &args.protected {
            ctx.pool.publish(parse_publish(spec, PortMode::Protected)?)?;
        }
        for spec in &args.private {
            ctx.pool.publish(parse_publish(spec, PortMode::Private)?)?;
        }
        let published = ctx.pool.published_ports();
        if published.is_empty() {
            return Err(anyhow!("nothing to publish, pass --public/--protected/--private"));
        }
        for port in &published {
            info!(
                local = port.local_port,
                remote = port.remote_port,
                mode = port.mode.as_atom(),
                "publishing port"
            );
        }
        let shutdown = signal_channel();
        supervise(&ctx, shutdown, move |_client, mut shutdown| async move {
            // Eingehende portopen-Frames bedient der Session-Dispatcher
            let _ = shutdown.changed().await;
            Ok(())
        })
        .await
    })
}

fn printable(value: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(value).ok()?;
    if !text.is_empty() && text.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        Some(text)
    } else {
        None
    }
}

fn run_config(opts: &NodeOpts, args: &ConfigArgs) -> Result<()> {
    let store = ClientStore::open(&opts.dbpath, opts.fsync).map_err(EdgeError::Store)?;
    for spec in &args.set {
        let (key, value) = spec
            .split_once('=')
            .ok_or_else(|| EdgeError::Config(format!("--set expects key=value, got {spec}")))?;
        if key.as_bytes() == KEY_PRIVATE && !args.unsafe_edit {
            return Err(EdgeError::Config(
                "refusing to overwrite the private key without --unsafe".to_string(),
            )
            .into());
        }
        let raw = match value.strip_prefix("0x") {
            Some(stripped) => hex::decode(stripped)
                .map_err(|e| EdgeError::Config(format!("value of {key}: {e}")))?,
            None => value.as_bytes().to_vec(),
        };
        store.put(key.as_bytes(), &raw).map_err(EdgeError::Store)?;
        println!("set {key}");
    }
    for key in &args.delete {
        store.del(key.as_bytes()).map_err(EdgeError::Store)?;
        println!("deleted {key}");
    }
    if args.list {
        if args.unsafe_edit {
            if let Some(secret) = store.get(KEY_PRIVATE).map_err(EdgeError::Store)? {
                println!("{:<20} : 0x{}", "private", hex::encode(secret));
            }
        }
        for key in store.list().map_err(EdgeError::Store)? {
            let name = String::from_utf8_lossy(&key).to_string();
            let value = store
                .get(&key)
                .map_err(EdgeError::Store)?
                .unwrap_or_default();
            match printable(&value) {
                Some(text) => println!("{name:<20} : {text}"),
                None => println!("{name:<20} : 0x{}", hex::encode(&value)),
            }
        }
    }
    Ok(())
}

fn run_bns(opts: &NodeOpts, args: &BnsArgs) -> Result<()> {
    if args.register.is_none() && args.lookup.is_none() {
        eprintln!("bns: pass --lookup <name> or --register <name>=<0x…>");
        std::process::exit(2);
    }
    let rt = runtime()?;
    rt.block_on(async {
        let ctx = build_ctx(opts)?;
        let client = connect_any(&ctx).await?;
        let result = bns_command(&client, args).await;
        client.close();
        result
    })
}

async fn bns_command(client: &RpcClient, args: &BnsArgs) -> Result<()> {
    if let Some(name) = &args.lookup {
        let addr = client.resolve_bns(name).await?;
        println!("{name} : {addr}");
    }
    if let Some(spec) = &args.register {
        let (name, dest) = spec
            .split_once('=')
            .ok_or_else(|| EdgeError::Client(format!("--register expects name=0x…, got {spec}")))?;
        if !contract::is_valid_bns(name) {
            return Err(EdgeError::Client(format!("invalid BNS name: {name}")).into());
        }
        let dest = Address::parse_hex(dest).map_err(|e| EdgeError::Client(e.to_string()))?;
        let nonce = client.account_nonce().await?;
        let data = contract::bns_register_calldata(name, &dest);
        let mut tx = Transaction::new(
            nonce,
            DEFAULT_GAS_PRICE,
            DEFAULT_GAS_LIMIT,
            contract::dns_contract(),
            0,
            data,
            0,
        );
        client.sign_transaction(&mut tx)?;
        client.send_transaction(&tx).await?;
        println!("transaction sent, waiting for confirmation...");
        let confirmed =
            watch_account(client, contract::dns_contract(), POLL_INTERVAL, MAX_POLLS).await;
        if !confirmed {
            return Err(anyhow!("registration of {name} not confirmed"));
        }
        println!("{name} registered to {dest}");
    }
    Ok(())
}

fn run_time(opts: &NodeOpts) -> Result<()> {
    let rt = runtime()?;
    rt.block_on(async {
        let ctx = build_ctx(opts)?;
        let client = connect_any(&ctx).await?;
        let result = async {
            let timestamp = client.chain_time().await?;
            let (number, _) = ctx.verifier.last_valid();
            println!("block {number} at unix time {timestamp}");
            Ok::<(), anyhow::Error>(())
        }
        .await;
        client.close();
        result
    })
}

fn run_reset(opts: &NodeOpts, args: &ResetArgs) -> Result<()> {
    if !args.force {
        return Err(anyhow!(
            "reset deletes the current credentials; pass --force to proceed"
        ));
    }
    let store = ClientStore::open(&opts.dbpath, opts.fsync).map_err(EdgeError::Store)?;
    store.del(KEY_PRIVATE).map_err(EdgeError::Store)?;
    store.del(KEY_FLEET).map_err(EdgeError::Store)?;
    store.del(KEY_WINDOW).map_err(EdgeError::Store)?;
    let secret = store.ensure_private_key().map_err(EdgeError::Store)?;
    let address = dc_crypto::secret_to_address(&secret)
        .map_err(|e| EdgeError::Config(e.to_string()))?;
    println!("new account 0x{}", hex::encode(address));
    Ok(())
}

fn run_update() -> Result<()> {
    println!("diode-node {}", env!("CARGO_PKG_VERSION"));
    println!("fetch releases from https://github.com/diodechain/releases/latest");
    Ok(())
}
