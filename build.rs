// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: repository directory
fn repo_arg() -> Arg {
    Arg::new("repo")
        .short('r')
        .long("repo")
        .value_name("DIR")
        .default_value("/var/lib/yangstore")
        .help("Repository directory")
}

fn build_cli() -> Command {
    Command::new("yscfg")
        .version(env!("CARGO_PKG_VERSION"))
        .about("yangstore datastore configuration tool")
        .subcommand(
            Command::new("export")
                .about("Print a module's datastore content")
                .arg(repo_arg()),
        )
        .subcommand(
            Command::new("import")
                .about("Replace a module's datastore content from a file")
                .arg(repo_arg()),
        )
        .subcommand(
            Command::new("copy")
                .about("Copy one conventional datastore onto another")
                .arg(repo_arg()),
        )
        .subcommand(Command::new("modules").about("List installed modules").arg(repo_arg()))
}

fn main() -> std::io::Result<()> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir)?;

    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer: Vec<u8> = Vec::new();
    man.render(&mut buffer)?;
    fs::write(man_dir.join("yscfg.1"), buffer)?;

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
