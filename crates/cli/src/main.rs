//! Command-line interface for archive filesystems.
//!
//! Inspects archives, browses the tree a mount would expose and test-decodes
//! every file through the same read path a filesystem driver uses.

use archivefs::{
    ArchiveFs, CredentialProvider, EngineRegistry, MountOptions, Parallelism, ReadPool,
    ReadRequest, RootSelection,
};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "archivefs")]
#[command(version, about = "Browse archives as read-only filesystems", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe archive metadata
    Probe {
        /// Archive file to probe
        archive: PathBuf,

        /// Password for archives with encrypted headers
        #[arg(short, long)]
        password: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List a directory of the mounted tree
    Ls {
        #[command(flatten)]
        mount: MountArgs,

        /// Directory to list
        #[arg(default_value = "/")]
        path: String,

        /// List every file below the directory
        #[arg(short = 'R', long)]
        recursive: bool,
    },

    /// Write a file of the mounted tree to stdout
    Cat {
        #[command(flatten)]
        mount: MountArgs,

        /// File to print
        path: String,
    },

    /// Decode every file and report failures
    Test {
        #[command(flatten)]
        mount: MountArgs,
    },
}

#[derive(Args)]
struct MountArgs {
    /// Archive file to mount
    archive: PathBuf,

    /// Directory of the archive to present as the root, or `:auto`
    #[arg(short, long)]
    root: Option<String>,

    /// Password; given without a value, it is asked for before mounting
    #[arg(short, long, num_args = 0..=1, default_missing_value = "")]
    password: Option<String>,

    /// Volume label
    #[arg(short, long)]
    label: Option<String>,

    /// Parallel read tasks: a number or `all`
    #[arg(short = 'j', long = "parallel", value_parser = parse_parallelism)]
    parallelism: Option<Parallelism>,

    /// Extractor switches, separated by `,` or `;`
    #[arg(short = 's', long = "switches")]
    switches: Vec<String>,
}

fn parse_parallelism(value: &str) -> Result<Parallelism, String> {
    if value.eq_ignore_ascii_case("all") {
        return Ok(Parallelism::All);
    }
    value
        .parse::<usize>()
        .map(Parallelism::Limit)
        .map_err(|_| format!("expected a number or `all`, got `{}`", value))
}

/// Asks on the terminal, once, when an encrypted entry is reached.
struct ConsolePrompt;

impl CredentialProvider for ConsolePrompt {
    fn prompt(&self) -> Option<String> {
        match rpassword::prompt_password("Password: ") {
            Ok(password) if !password.is_empty() => Some(password),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(error = %err, "could not read password");
                None
            }
        }
    }
}

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Probe {
            archive,
            password,
            json,
        } => handle_probe(archive, password, json),
        Commands::Ls {
            mount,
            path,
            recursive,
        } => handle_ls(mount, &path, recursive),
        Commands::Cat { mount, path } => handle_cat(mount, &path),
        Commands::Test { mount } => handle_test(mount),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn mount(args: MountArgs) -> Result<Arc<ArchiveFs>, Box<dyn std::error::Error>> {
    let mut options = MountOptions::new(args.archive.clone());
    options.root = args.root.map(|root| {
        if root.trim() == ":auto" {
            RootSelection::Auto
        } else {
            RootSelection::Path(root)
        }
    });
    options.password = match args.password.as_deref() {
        Some("") => ConsolePrompt.prompt(),
        Some(password) => Some(password.to_string()),
        None => None,
    };
    options.volume_label = args.label;
    if let Some(parallelism) = args.parallelism {
        options.parallelism = parallelism;
    }
    for raw in &args.switches {
        options.add_switches(raw);
    }

    let registry = EngineRegistry::builtin();
    let fs = Arc::new(ArchiveFs::mount(options, &registry, Arc::new(ConsolePrompt))?);

    if let Err(err) = ctrlc::set_handler(interrupt_handler(&fs)) {
        tracing::warn!(error = %err, "could not install interrupt handler");
    }

    Ok(fs)
}

/// Unmounts `fs` on interrupt without keeping it alive.
fn interrupt_handler(fs: &Arc<ArchiveFs>) -> impl Fn() + Send + 'static {
    let fs = Arc::downgrade(fs);
    move || {
        eprintln!("Interrupted, unmounting...");
        if let Some(fs) = fs.upgrade() {
            fs.unmount();
        }
    }
}

fn handle_probe(
    archive: PathBuf,
    password: Option<String>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let info = archivefs::probe::probe_archive(&EngineRegistry::builtin(), &archive, password)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Format:       {}", info.format);
    println!("Entries:      {}", info.entries);
    if let Some(bytes) = info.compressed_bytes {
        println!("Compressed:   {} bytes", bytes);
    }
    if let Some(bytes) = info.uncompressed_estimate {
        println!("Uncompressed: {} bytes", bytes);
    }
    println!("Encrypted:    {}", if info.encrypted { "yes" } else { "no" });
    println!("Solid blocks: {}", info.solid_blocks);
    println!();
    for entry in &info.entry_list {
        let kind = if entry.is_directory { 'd' } else { '-' };
        let lock = if entry.encrypted { '*' } else { ' ' };
        let block = entry
            .block
            .map(|b| b.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{}{} {:>12} {:>5}  {}", kind, lock, entry.size, block, entry.path);
    }
    Ok(())
}

fn handle_ls(args: MountArgs, path: &str, recursive: bool) -> Result<(), Box<dyn std::error::Error>> {
    let fs = mount(args)?;

    if recursive {
        let prefix = path.trim_end_matches('/');
        for (file, _) in fs.namespace().files() {
            if prefix.is_empty() || file.starts_with(&format!("{}/", prefix)) {
                println!("{}", file);
            }
        }
        return Ok(());
    }

    for child in fs.list_directory(path)? {
        let kind = if child.attributes.is_directory() { 'd' } else { '-' };
        println!("{} {:>12}  {}", kind, child.attributes.size, child.name);
    }
    Ok(())
}

fn handle_cat(args: MountArgs, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let fs = mount(args)?;
    let bytes = fs.read_file(path)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&bytes)?;
    stdout.flush()?;
    Ok(())
}

fn handle_test(args: MountArgs) -> Result<(), Box<dyn std::error::Error>> {
    let fs = mount(args)?;
    println!("Volume: {}", fs.volume_label());

    let requests: Vec<ReadRequest> = fs
        .namespace()
        .files()
        .into_iter()
        .filter_map(|(path, index)| {
            let size = fs.archive().entry(index)?.size;
            Some(ReadRequest::whole(path, size))
        })
        .collect();

    let pool = ReadPool::new(fs.parallelism())?;
    let progress = ProgressBar::new(requests.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let results = pool.read_all(&fs, requests, |done| {
        progress.set_message(done.path.clone());
        progress.inc(1);
    });
    progress.finish_and_clear();

    let failures: Vec<_> = results.iter().filter(|r| r.result.is_err()).collect();
    for failure in &failures {
        if let Err(err) = &failure.result {
            eprintln!("{}: {}", failure.path, err);
        }
    }

    let stats = fs.cache_stats();
    println!(
        "Blocks: {}, decode passes: {}",
        fs.archive().block_count(),
        stats.decode_passes
    );
    tracing::debug!(
        passes = stats.decode_passes,
        hits = stats.hits,
        evictions = stats.evictions,
        "cache statistics"
    );

    if failures.is_empty() {
        println!("Test passed.");
        Ok(())
    } else {
        Err(format!("{} of {} files failed", failures.len(), results.len()).into())
    }
}
