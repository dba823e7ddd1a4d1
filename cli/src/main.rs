use std::path::PathBuf;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use colored::*;
use wgtopo_engine::{build, flatten, plan, BuildFailure};
use wgtopo_keystore::{FileKeyStore, KeyProvider, MemoryKeyStore};
use wgtopo_shared::{Diagnostic, Document, Error, Network, TopologyInput};

mod render;
mod util;

#[derive(Clone, Debug, Parser)]
#[clap(name = "wgtopo", author, version, about)]
struct Opts {
    #[clap(subcommand)]
    command: Command,

    /// Verbose output, use -vv for even more
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Build per-node WireGuard configs from a network description
    Build {
        /// The network description (TOML or JSON)
        config: PathBuf,

        /// Where generated keys are persisted
        #[clap(short, long, default_value = "wgtopo-keys.json")]
        keys: PathBuf,

        /// Output directory for the generated .conf files
        #[clap(short, long, default_value = "out")]
        out: PathBuf,

        /// Use throwaway keys instead of the key store
        #[clap(long)]
        ephemeral: bool,
    },

    /// Validate a description and report every problem without touching keys
    Check { config: PathBuf },

    /// Print the equivalent flat (traditional-form) document
    Expand { config: PathBuf },

    /// Summarize the per-node peer tables
    Show {
        config: PathBuf,

        /// Emit the resolved peer tables as JSON instead of text
        #[clap(long)]
        json: bool,
    },
}

fn main() {
    let opts = Opts::parse();
    util::init_logger(opts.verbose);

    if let Err(e) = run(opts.command) {
        eprintln!("{} {}", "[E]".red(), e);
        std::process::exit(1);
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Build {
            config,
            keys,
            out,
            ephemeral,
        } => cmd_build(&config, &keys, &out, ephemeral),
        Command::Check { config } => cmd_check(&config),
        Command::Expand { config } => cmd_expand(&config),
        Command::Show { config, json } => cmd_show(&config, json),
    }
}

fn load(path: &PathBuf) -> anyhow::Result<(Network, TopologyInput)> {
    let document = Document::from_path(path)?;
    document.into_model().map_err(report_errors)
}

fn report_errors(errors: Vec<Error>) -> anyhow::Error {
    for error in &errors {
        eprintln!("{} {}", "[E]".red(), error);
    }
    anyhow!("{} problem(s) in the network description", errors.len())
}

fn report_failure(failure: BuildFailure) -> anyhow::Error {
    report_errors(failure.errors)
}

fn report_diagnostics(diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        eprintln!("{} {}", "[!]".yellow(), diagnostic);
    }
}

fn cmd_build(config: &PathBuf, keys: &PathBuf, out: &PathBuf, ephemeral: bool) -> anyhow::Result<()> {
    let (network, input) = load(config)?;

    let mut file_store;
    let mut memory_store;
    let store: &mut dyn KeyProvider = if ephemeral {
        memory_store = MemoryKeyStore::new();
        &mut memory_store
    } else {
        file_store = FileKeyStore::open(keys)?;
        &mut file_store
    };

    let output = build(&network, &input, store).map_err(report_failure)?;
    report_diagnostics(&output.diagnostics);

    for (name, record) in &output.records {
        let path = out.join(format!("{name}.conf"));
        util::write_private(&path, &render::render(record))?;
        println!(
            "{} {} ({} peer{})",
            "wrote".green(),
            path.display().to_string().bold(),
            record.peers.len(),
            if record.peers.len() == 1 { "" } else { "s" },
        );
    }
    Ok(())
}

fn cmd_check(config: &PathBuf) -> anyhow::Result<()> {
    let (network, input) = load(config)?;
    let (resolved, diagnostics) = plan(&network, &input).map_err(report_failure)?;
    report_diagnostics(&diagnostics);

    let entries: usize = resolved.values().map(Vec::len).sum();
    println!(
        "{} {} node(s), {} peer entr{}, {} diagnostic(s)",
        "ok:".green().bold(),
        resolved.len(),
        entries,
        if entries == 1 { "y" } else { "ies" },
        diagnostics.len(),
    );
    Ok(())
}

fn cmd_expand(config: &PathBuf) -> anyhow::Result<()> {
    let (network, input) = load(config)?;
    let (resolved, _) = plan(&network, &input).map_err(report_failure)?;
    print!("{}", flatten::to_document(&network, &resolved).to_toml_string());
    Ok(())
}

fn cmd_show(config: &PathBuf, json: bool) -> anyhow::Result<()> {
    let (network, input) = load(config)?;
    let (resolved, diagnostics) = plan(&network, &input).map_err(report_failure)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&resolved)?);
        return Ok(());
    }

    for (name, peers) in &resolved {
        let node = network.node(name).expect("resolved map only holds known nodes");
        println!(
            "{} {} {}",
            name.to_string().bold(),
            node.wireguard_ip.to_string().dimmed(),
            if node.forwards() { "(forwards)".cyan().to_string() } else { String::new() },
        );
        if peers.is_empty() {
            println!("  {}", "no peers".dimmed());
        }
        for peer in peers {
            let endpoint = peer
                .endpoint
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "passive".dimmed().to_string());
            let routes: Vec<String> = peer.allowed_ips.iter().map(|n| n.to_string()).collect();
            println!(
                "  {} {} {} [{}]",
                "→".dimmed(),
                peer.peer.to_string().bold(),
                endpoint,
                routes.join(", "),
            );
        }
    }
    report_diagnostics(&diagnostics);
    Ok(())
}
