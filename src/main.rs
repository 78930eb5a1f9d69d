use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use docdb::{ConnectOpts, Context, HandshakeVersion, Session};
use serde_json::{Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "docdb-cli")]
#[command(about = "Run queries against a docdb cluster", long_about = None)]
struct Args {
    /// Seed address (host[:port]), repeatable
    #[arg(short, long = "address", env = "DOCDB_ADDRESS", value_delimiter = ',', default_value = "localhost:28015")]
    addresses: Vec<String>,

    /// Default database
    #[arg(short, long, env = "DOCDB_DATABASE")]
    database: Option<String>,

    #[arg(short, long, env = "DOCDB_USER", default_value = "admin")]
    user: String,

    #[arg(long, env = "DOCDB_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Auth key for the legacy handshake
    #[arg(long, env = "DOCDB_AUTH_KEY", default_value = "", hide_env_values = true)]
    auth_key: String,

    #[arg(long, value_enum, default_value_t = Handshake::V1)]
    handshake: Handshake,

    /// Connections per server
    #[arg(long, default_value_t = 1)]
    max_open: usize,

    /// Follow the server list to find the other cluster members
    #[arg(long)]
    discover_hosts: bool,

    /// Per-operation timeout in seconds
    #[arg(long, default_value_t = 20)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Handshake {
    /// Auth key prelude
    Legacy,
    /// SCRAM-SHA-256
    V1,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the identity of the server answering queries
    Info,
    /// List cluster members
    Nodes {
        /// Give discovery this many milliseconds to find servers
        #[arg(long, default_value_t = 1000)]
        wait_ms: u64,
    },
    /// Run a term given in its JSON wire form and print the results
    Query {
        term: String,
        /// Global optargs as a JSON object
        #[arg(long)]
        opts: Option<String>,
    },
    /// Wait for outstanding noreply writes on every server
    NoreplyWait,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docdb=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let timeout = Duration::from_secs(args.timeout);
    let mut addresses = args.addresses.into_iter();
    let opts = ConnectOpts {
        address: addresses.next(),
        addresses: addresses.collect(),
        database: args.database,
        username: args.user,
        password: args.password,
        auth_key: args.auth_key,
        handshake_version: match args.handshake {
            Handshake::Legacy => HandshakeVersion::V0_4,
            Handshake::V1 => HandshakeVersion::V1_0,
        },
        timeout: Some(timeout),
        max_open: args.max_open,
        discover_hosts: args.discover_hosts,
        ..Default::default()
    };

    let session = Session::connect(opts)
        .await
        .context("failed to connect")?;
    let ctx = Context::with_timeout(timeout);

    match args.command {
        Command::Info => {
            let server = session.server(&ctx).await?;
            println!("{}", serde_json::to_string_pretty(&server)?);
        }
        Command::Nodes { wait_ms } => {
            if session.opts().discover_hosts {
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
            for node in session.nodes() {
                println!("{}\t{}\t{}", node.id(), node.name(), node.host());
            }
        }
        Command::Query { term, opts } => {
            let term: Value = serde_json::from_str(&term).context("term is not valid JSON")?;
            let opts: Map<String, Value> = match opts {
                Some(raw) => serde_json::from_str(&raw).context("opts must be a JSON object")?,
                None => Map::new(),
            };

            let q = session.new_query(term, opts);
            if let Some(mut cursor) = session.query(&ctx, q).await? {
                while let Some(doc) = cursor.try_next::<Value>().await? {
                    println!("{}", doc);
                }
                cursor.close().await;
            }
        }
        Command::NoreplyWait => {
            session.noreply_wait(&ctx).await?;
            tracing::info!("All noreply queries processed");
        }
    }

    session.close();
    Ok(())
}
