// src/bin/yscfg.rs

//! Offline datastore configuration tool.
//!
//! Exports and imports a module's datastore content, copies conventional
//! datastores, and lists installed modules. Works through a regular
//! connection, so running instances observe the changes like any other
//! commit.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use yangstore::{BasicSchema, ConnOptions, Connection, Datastore, Layout, OperOptions, Session};

#[derive(Parser)]
#[command(name = "yscfg", version, about = "yangstore datastore configuration tool")]
struct Cli {
    /// Repository directory
    #[arg(short, long, default_value = "/var/lib/yangstore")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a module's datastore content as JSON
    Export {
        module: String,
        #[arg(short, long, default_value = "running")]
        datastore: String,
        /// Selection XPath
        #[arg(short, long)]
        xpath: Option<String>,
    },
    /// Replace a module's datastore content from a JSON file (or stdin)
    Import {
        module: String,
        #[arg(short, long, default_value = "running")]
        datastore: String,
        /// Input file; stdin when omitted
        file: Option<PathBuf>,
    },
    /// Copy one conventional datastore onto another
    Copy {
        #[arg(short, long)]
        module: Option<String>,
        from: String,
        to: String,
    },
    /// List installed modules
    Modules,
}

fn parse_ds(name: &str) -> anyhow::Result<Datastore> {
    match name {
        "startup" => Ok(Datastore::Startup),
        "running" => Ok(Datastore::Running),
        "candidate" => Ok(Datastore::Candidate),
        "operational" => Ok(Datastore::Operational),
        other => bail!("unknown datastore '{other}'"),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let layout = Layout::new(&cli.repo).context("resolving repository layout")?;
    let schema = Arc::new(BasicSchema::new());
    let conn = Connection::connect(layout, schema, ConnOptions::default())
        .context("connecting to the datastore")?;
    let mut session = Session::start(conn.clone(), &whoami());

    match cli.command {
        Command::Export {
            module,
            datastore,
            xpath,
        } => {
            session.switch_datastore(parse_ds(&datastore)?);
            let xpath = xpath.unwrap_or_else(|| format!("/{module}:*"));
            let data = session
                .get_data(&xpath, OperOptions::default(), 5_000)
                .context("reading datastore")?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Command::Import {
            module,
            datastore,
            file,
        } => {
            session.switch_datastore(parse_ds(&datastore)?);
            let content = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let data: yangstore::Forest = serde_json::from_str(&content)?;
            session
                .replace_config(Some(&module), data, 5_000)
                .context("importing datastore content")?;
        }
        Command::Copy { module, from, to } => {
            session
                .copy_config(module.as_deref(), parse_ds(&from)?, parse_ds(&to)?, 5_000)
                .context("copying datastore")?;
        }
        Command::Modules => {
            for info in conn.modules() {
                let rev = info.revision.as_deref().unwrap_or("-");
                println!("{}\t{}\tver {}", info.name, rev, info.ver);
            }
        }
    }
    Ok(())
}

fn whoami() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| "unknown".to_string())
}
