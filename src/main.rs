use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use ldap_session::{Config, Connection, Entry, SearchOptions, SearchScope};
use serde_json::{json, Map, Value};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scope {
    Base,
    One,
    Sub,
}

impl From<Scope> for SearchScope {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Base => SearchScope::Base,
            Scope::One => SearchScope::OneLevel,
            Scope::Sub => SearchScope::Subtree,
        }
    }
}

#[derive(Parser)]
#[command(name = "ldap-session")]
#[command(about = "LDAPv3 client - binds and runs one search, printing entries as they stream in")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Server URL (overrides config; e.g. ldap://ldap.example.com:389)
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Bind DN (overrides config)
    #[arg(short = 'D', long, value_name = "DN")]
    binddn: Option<String>,

    /// Bind password (overrides config)
    #[arg(short = 'w', long, value_name = "PASSWORD")]
    password: Option<String>,

    /// Search base (overrides config)
    #[arg(short, long, value_name = "DN")]
    base: Option<String>,

    /// Search scope
    #[arg(short, long, value_enum, default_value = "sub")]
    scope: Scope,

    /// Size limit (0 = none)
    #[arg(short = 'l', long, value_name = "SIZE", default_value_t = 0)]
    size_limit: i32,

    /// Print entries as JSON, one object per line
    #[arg(long)]
    json: bool,

    /// Print connection counters to stderr when done
    #[arg(long)]
    stats: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Search filter
    #[arg(default_value = "(objectClass=*)")]
    filter: String,

    /// Attributes to return (all user attributes when empty)
    attrs: Vec<String>,
}

/// LDIF-style text. Values that are not UTF-8 are summarized.
fn write_ldif(out: &mut impl Write, entry: &Entry) -> std::io::Result<()> {
    writeln!(out, "dn: {}", entry.dn)?;
    for attr in entry.attributes.iter() {
        for value in attr.values() {
            match std::str::from_utf8(value) {
                Ok(text) => writeln!(out, "{}: {}", attr.name(), text)?,
                Err(_) => writeln!(out, "# {}: binary value, {} bytes", attr.name(), value.len())?,
            }
        }
    }
    writeln!(out)
}

fn entry_json(entry: &Entry) -> Value {
    let mut attrs = Map::new();
    for attr in entry.attributes.iter() {
        let values: Vec<Value> = attr
            .values()
            .map(|v| Value::String(String::from_utf8_lossy(v).into_owned()))
            .collect();
        attrs.insert(attr.name().to_string(), Value::Array(values));
    }
    json!({ "dn": entry.dn, "attributes": attrs })
}

async fn run(args: &Args, conn: &Connection, config: &Config) -> Result<usize> {
    if let Some(dn) = &config.bind.binddn {
        let password = config.bind.credentials.as_deref().unwrap_or_default();
        conn.bind(dn, password)
            .await
            .with_context(|| format!("Bind as {}", dn))?;
    }

    let base = args
        .base
        .clone()
        .or_else(|| config.search.base.clone())
        .unwrap_or_default();
    let attrs: Vec<&str> = args.attrs.iter().map(String::as_str).collect();
    let options = SearchOptions::default().size_limit(args.size_limit);
    let mut stream = conn
        .search(&base, args.scope.into(), &args.filter, &attrs, &options)
        .await
        .context("Start search")?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let finished = async {
        while stream.has_more().await? {
            let entry = stream.next_entry().await?;
            if args.json {
                writeln!(out, "{}", entry_json(&entry))?;
            } else {
                write_ldif(&mut out, &entry)?;
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;
    out.flush()?;

    for uri in stream.referrals() {
        info!("Referral: {}", uri);
    }
    finished.with_context(|| format!("Search after {} entries", stream.count()))?;
    Ok(stream.count())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_session={},info", log_level))
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(url) = &args.url {
        config.server.url = url.clone();
    }
    if let Some(dn) = &args.binddn {
        config.bind.binddn = Some(dn.clone());
    }
    if let Some(password) = &args.password {
        config.bind.credentials = Some(password.clone());
    }

    let (host, port, _) = config.server_address()?;
    let options = config.connection_options()?;
    debug!("Connection options: {:?}", options);

    let conn = Connection::new(options);
    conn.connect(&host, port, config.connect_timeout())
        .await
        .with_context(|| format!("Connect to {}", config.server.url))?;

    let result = run(&args, &conn, &config).await;
    conn.disconnect().await;

    if args.stats {
        eprintln!("{}", serde_json::to_string_pretty(&conn.metrics().snapshot())?);
    }
    let count = result?;
    info!("{} entries returned", count);
    Ok(())
}
