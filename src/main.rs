//! sandpath - inspect and edit the path state of a sandbox
//!
//! Usage:
//!   sandpath init                     - Write a configuration and create the box
//!   sandpath flags <path>             - Show overlay flags of a path
//!   sandpath delete <path>            - Mark a path deleted
//!   sandpath policy --image <exe> <p> - Show the access decision for a path
//!   sandpath scramble <name> --key    - Scramble a short name

use clap::{Parser, Subcommand};
use sandpath::{
    config::Config,
    engine::BoxEngine,
    overlay::PathFlags,
    policy::ResourceKind,
    shortname::ShortName,
    snapshot::{default_checksum, scramble_key},
    Error, Result,
};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sandpath")]
#[command(version = "0.1.0")]
#[command(about = "Path virtualization state of an application sandbox")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/sandpath/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file and create the box directory
    Init {
        /// Box name
        #[arg(long)]
        name: Option<String>,

        /// Host directory of the box
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Virtual path prefix of the box
        #[arg(long)]
        prefix: Option<String>,

        /// Settings file with the access rules
        #[arg(long)]
        settings: Option<PathBuf>,
    },

    /// Show the overlay flags of a path
    Flags {
        path: String,

        /// Treat the path as a registry key
        #[arg(long)]
        key: bool,
    },

    /// Mark a path (or a registry value with --value) deleted
    Delete {
        path: String,

        #[arg(long)]
        key: bool,

        /// Registry value below the key
        #[arg(long, requires = "key")]
        value: Option<String>,
    },

    /// Record that a path now lives somewhere else
    Relocate {
        old_path: String,
        new_path: String,

        #[arg(long)]
        key: bool,
    },

    /// Forget all marks on a path and everything below it
    Undelete {
        path: String,

        #[arg(long)]
        key: bool,

        #[arg(long, requires = "key")]
        value: Option<String>,
    },

    /// Resolve a path through relocations and snapshot layers
    Resolve {
        path: String,

        #[arg(long)]
        key: bool,
    },

    /// Decide how a process may access a path
    Policy {
        path: String,

        /// Image name of the process
        #[arg(long)]
        image: String,

        /// Resource kind (File, Pipe, Key, Conf, Ipc, Wnd)
        #[arg(long, default_value = "File")]
        kind: ResourceKind,

        /// The process was started inside the box
        #[arg(long)]
        from_box: bool,
    },

    /// Scramble a short (8.3) name
    Scramble {
        name: String,

        /// Scramble key, 8 hex digits
        #[arg(long, value_parser = parse_key, conflicts_with = "snapshot")]
        key: Option<u32>,

        /// Derive the key from a snapshot identifier
        #[arg(long)]
        snapshot: Option<String>,
    },

    /// Reverse a scrambled short name
    Unscramble {
        name: String,

        #[arg(long, value_parser = parse_key, conflicts_with = "snapshot")]
        key: Option<u32>,

        #[arg(long)]
        snapshot: Option<String>,
    },

    /// List the snapshot layers of the box
    Snapshots,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    // Expand ~ in config path
    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &PathBuf) -> Result<()> {
    match command {
        Commands::Init {
            name,
            dir,
            prefix,
            settings,
        } => cmd_init(config_path, name, dir, prefix, settings),

        Commands::Flags { path, key } => cmd_flags(config_path, &path, key),

        Commands::Delete { path, key, value } => cmd_delete(config_path, &path, key, value),

        Commands::Relocate {
            old_path,
            new_path,
            key,
        } => cmd_relocate(config_path, &old_path, &new_path, key),

        Commands::Undelete { path, key, value } => cmd_undelete(config_path, &path, key, value),

        Commands::Resolve { path, key } => cmd_resolve(config_path, &path, key),

        Commands::Policy {
            path,
            image,
            kind,
            from_box,
        } => cmd_policy(config_path, &path, &image, kind, from_box),

        Commands::Scramble {
            name,
            key,
            snapshot,
        } => cmd_scramble(&name, key, snapshot, true),

        Commands::Unscramble {
            name,
            key,
            snapshot,
        } => cmd_scramble(&name, key, snapshot, false),

        Commands::Snapshots => cmd_list_snapshots(config_path),
    }
}

/// Load the configuration file, or fall back to defaults plus environment
fn load_config(config_path: &PathBuf) -> Result<Config> {
    if config_path.exists() {
        Config::load(config_path)
    } else {
        info!("No config at {:?}, using defaults", config_path);
        Config::from_env()
    }
}

fn open_engine(config_path: &PathBuf) -> Result<BoxEngine> {
    BoxEngine::open(load_config(config_path)?)
}

fn cmd_init(
    config_path: &PathBuf,
    name: Option<String>,
    dir: Option<PathBuf>,
    prefix: Option<String>,
    settings: Option<PathBuf>,
) -> Result<()> {
    let mut config = Config::default();
    if let Some(name) = name {
        config.sandbox.prefix = format!(r"C:\Sandbox\{}", name);
        config.sandbox.dir = config
            .sandbox
            .dir
            .parent()
            .map(|p| p.join(&name))
            .unwrap_or_else(|| PathBuf::from(&name));
        config.sandbox.name = name;
    }
    if let Some(dir) = dir {
        config.sandbox.dir = dir;
    }
    if let Some(prefix) = prefix {
        config.sandbox.prefix = prefix;
    }
    config.policy.settings_file = settings;
    config.validate()?;

    // Ensure config directory exists
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    config.save(config_path)?;
    config.ensure_directories()?;

    println!("Configuration saved to {:?}", config_path);
    println!("Box {} at {:?}", config.sandbox.name, config.sandbox.dir);
    println!("Virtual prefix: {}", config.sandbox.prefix);
    Ok(())
}

fn cmd_flags(config_path: &PathBuf, path: &str, key: bool) -> Result<()> {
    let engine = open_engine(config_path)?;
    let flags = if key {
        engine.resolve_key(path).flags
    } else {
        let copy = engine.copy_path(path);
        engine.file_flags(path, copy.as_deref())
    };
    println!("{}: {:?} (0x{:08x})", path, flags, flags.bits());
    Ok(())
}

fn cmd_delete(config_path: &PathBuf, path: &str, key: bool, value: Option<String>) -> Result<()> {
    let engine = open_engine(config_path)?;
    let outcome = if key {
        engine.mark_key_deleted(path, value.as_deref())
    } else {
        engine.mark_file_deleted(path)
    };

    if outcome.newly_set {
        println!("Deleted {}", path);
    } else {
        println!("{} was already deleted", path);
    }
    if outcome.truncated {
        println!("Discarded marks below {}", path);
    }
    Ok(())
}

fn cmd_relocate(config_path: &PathBuf, old_path: &str, new_path: &str, key: bool) -> Result<()> {
    let engine = open_engine(config_path)?;
    if key {
        engine.set_key_relocation(old_path, new_path);
    } else {
        engine.set_file_relocation(old_path, new_path);
    }
    println!("{} -> {}", old_path, new_path);
    Ok(())
}

fn cmd_undelete(config_path: &PathBuf, path: &str, key: bool, value: Option<String>) -> Result<()> {
    let engine = open_engine(config_path)?;
    let removed = if key {
        engine.undelete_key(path, value.as_deref())
    } else {
        engine.undelete_file(path)
    };

    if removed {
        println!("Cleared {}", path);
    } else {
        println!("Nothing recorded for {}", path);
    }
    Ok(())
}

fn cmd_resolve(config_path: &PathBuf, path: &str, key: bool) -> Result<()> {
    let engine = open_engine(config_path)?;
    let (lookup, copy) = if key {
        (engine.resolve_key(path), None)
    } else {
        let copy = engine.copy_path(path);
        (engine.resolve_file(path, copy.as_deref()), copy)
    };

    println!("Path:       {}", path);
    if let Some(copy) = copy {
        println!("Copy path:  {}", copy);
    }
    println!("Flags:      {:?}", lookup.flags);
    match lookup.relocation {
        Some(target) if lookup.flags.contains(PathFlags::IN_SNAPSHOT) => {
            println!("Snapshot:   {}", target)
        }
        Some(target) => println!("Relocated:  {}", target),
        None => {}
    }
    Ok(())
}

fn cmd_policy(
    config_path: &PathBuf,
    path: &str,
    image: &str,
    kind: ResourceKind,
    from_box: bool,
) -> Result<()> {
    let engine = open_engine(config_path)?;
    let process = engine.identify(image, from_box);
    let decision = engine.decide(&process, kind, path, None);

    println!("Access:     {}", decision.access);
    println!(
        "Mapping:    {}",
        serde_json::to_string(&decision.mapping)?
    );
    println!(
        "Rule:       {}",
        decision.rule.as_deref().unwrap_or("(default)")
    );
    if !decision.flags.is_empty() {
        println!("Flags:      {:?}", decision.flags);
    }
    if let Some(target) = decision.relocation {
        println!("Relocation: {}", target);
    }
    Ok(())
}

fn cmd_scramble(name: &str, key: Option<u32>, snapshot: Option<String>, forward: bool) -> Result<()> {
    let key = match (key, snapshot) {
        (Some(key), _) => key,
        (None, Some(id)) => scramble_key(&id, default_checksum),
        (None, None) => {
            return Err(Error::Config(
                "either --key or --snapshot is required".to_string(),
            ))
        }
    };

    let mut short = ShortName::new(name)
        .ok_or_else(|| Error::Config(format!("{:?} is not a short name", name)))?;
    let changed = if forward {
        short.scramble(key)
    } else {
        short.unscramble(key)
    };

    if !changed {
        info!("{} left unchanged", name);
    }
    println!("{}", short);
    Ok(())
}

fn cmd_list_snapshots(config_path: &PathBuf) -> Result<()> {
    let engine = open_engine(config_path)?;
    let chain = engine.file_chain();

    println!("Snapshots of {}", engine.config().sandbox.name);
    println!("=============");
    if chain.is_empty() {
        println!("(none)");
    }
    for (depth, snapshot) in chain.snapshots().iter().enumerate() {
        println!(
            "{:>2}  {:<16}  key {}  {}",
            depth,
            snapshot.id(),
            hex::encode(snapshot.scramble_key().to_be_bytes()),
            snapshot.name().unwrap_or("")
        );
    }
    Ok(())
}

/// Parse an 8 digit hex scramble key
fn parse_key(s: &str) -> std::result::Result<u32, String> {
    let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|e| e.to_string())?;
    let bytes: [u8; 4] = bytes
        .try_into()
        .map_err(|_| "key must be 8 hex digits".to_string())?;
    Ok(u32::from_be_bytes(bytes))
}

/// Expand ~ to home directory
fn expand_tilde(path: &PathBuf) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.clone()
}
