//! k2filter: CLI tool for managing filter rule sources and testing URLs.

use clap::{Parser, Subcommand};
use k2filter::{
    ExceptionsList, FrameContext, Request, ResourceKind, RuleGroup, RuleService,
    RuleServiceBuilder, RuleServiceConfig, SourceId,
};
use std::path::PathBuf;
use url::Url;

#[derive(Parser)]
#[command(name = "k2filter")]
#[command(author = "Kaitu.io")]
#[command(version = "0.1.0")]
#[command(about = "Manage content-filtering rule sources and test URLs against them", long_about = None)]
struct Cli {
    /// YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory, overrides the config file
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List groups, rule sources and index state
    List,

    /// Add a rule source fetched from a URL
    AddUrl {
        /// tracking or ad-blocking
        group: String,
        url: String,
    },

    /// Add a rule source read from a local file
    AddFile {
        /// tracking or ad-blocking
        group: String,
        path: PathBuf,
    },

    /// Delete a rule source
    Remove { group: String, id: String },

    /// Fetch a rule source now
    Fetch { group: String, id: String },

    /// Enable a rule group
    Enable { group: String },

    /// Disable a rule group
    Disable { group: String },

    /// Manage exception lists
    Exception {
        #[command(subcommand)]
        action: ExceptionAction,
    },

    /// Check whether a URL would be blocked
    Check {
        url: String,

        /// Page that makes the request
        #[arg(short, long)]
        origin: Option<String>,

        /// Resource kind (document, script, image, ...)
        #[arg(short, long, default_value = "other")]
        kind: String,
    },

    /// Show blocked-domain counters
    Counters {
        /// Reset the counters
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Subcommand)]
enum ExceptionAction {
    /// Add a domain to an exception list
    Add {
        group: String,
        domain: String,
        /// exempt_list or process_list
        #[arg(short, long, default_value = "exempt_list")]
        list: String,
    },
    /// Remove a domain and its parent domains from an exception list
    Remove {
        group: String,
        domain: String,
        #[arg(short, long, default_value = "exempt_list")]
        list: String,
    },
    /// Empty an exception list
    Clear {
        group: String,
        #[arg(short, long, default_value = "exempt_list")]
        list: String,
    },
    /// Print an exception list
    List {
        group: String,
        #[arg(short, long, default_value = "exempt_list")]
        list: String,
    },
    /// Select which exception list is active
    Active { group: String, list: String },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> CliResult<()> {
    let mut config = match &cli.config {
        Some(path) => RuleServiceConfig::load(path)?,
        None => RuleServiceConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let mut service = RuleServiceBuilder::new(config).load()?.wait();
    service.run_until_idle();

    match cli.command {
        Commands::List => list(&service),
        Commands::AddUrl { group, url } => {
            let id = service.add_rules_from_url(parse_group(&group)?, &Url::parse(&url)?)?;
            service.run_until_idle();
            print_source(&service, parse_group(&group)?, id);
        }
        Commands::AddFile { group, path } => {
            let path = std::fs::canonicalize(&path)?;
            let id = service.add_rules_from_file(parse_group(&group)?, &path)?;
            service.run_until_idle();
            print_source(&service, parse_group(&group)?, id);
        }
        Commands::Remove { group, id } => {
            service.delete_rule_source(parse_group(&group)?, parse_id(&id)?)?;
            service.run_until_idle();
            println!("Removed {}", id);
        }
        Commands::Fetch { group, id } => {
            let group = parse_group(&group)?;
            let id = parse_id(&id)?;
            service.fetch_rule_source_now(group, id)?;
            service.run_until_idle();
            print_source(&service, group, id);
        }
        Commands::Enable { group } => service.set_rule_group_enabled(parse_group(&group)?, true),
        Commands::Disable { group } => service.set_rule_group_enabled(parse_group(&group)?, false),
        Commands::Exception { action } => exception(&mut service, action)?,
        Commands::Check { url, origin, kind } => {
            let kind = ResourceKind::parse(&kind).ok_or_else(|| format!("unknown resource kind: {}", kind))?;
            let url = Url::parse(&url)?;
            let origin = origin.as_deref().map(Url::parse).transpose()?;
            let frame = FrameContext {
                tab_id: 0,
                is_main_frame: kind == ResourceKind::Document,
            };
            let blocked = if kind == ResourceKind::Document && origin.is_none() {
                RuleGroup::ALL
                    .into_iter()
                    .any(|group| service.is_document_blocked(group, frame, &url))
            } else {
                service.should_block_request(&Request::new(url.clone(), origin, kind).with_frame(frame))
            };
            println!("{} {}", if blocked { "BLOCKED" } else { "ALLOWED" }, url);
        }
        Commands::Counters { clear } => {
            if clear {
                service.clear_blocked_counters();
            }
            for group in RuleGroup::ALL {
                println!("{}:", group);
                for (domain, count) in service.reporter().blocked_domains(group) {
                    println!("  {:>8}  {}", count, domain);
                }
            }
        }
    }

    service.run_until_idle();
    if !service.shutdown() {
        return Err("failed to write state".into());
    }
    Ok(())
}

fn exception(service: &mut RuleService, action: ExceptionAction) -> CliResult<()> {
    match action {
        ExceptionAction::Add { group, domain, list } => {
            if !service.add_exception_for_domain(parse_group(&group)?, parse_list(&list)?, &domain) {
                println!("{} is already listed", domain);
            }
        }
        ExceptionAction::Remove { group, domain, list } => {
            if !service.remove_exception_for_domain(parse_group(&group)?, parse_list(&list)?, &domain) {
                println!("{} is not listed", domain);
            }
        }
        ExceptionAction::Clear { group, list } => {
            service.remove_all_exceptions(parse_group(&group)?, parse_list(&list)?);
        }
        ExceptionAction::List { group, list } => {
            let group = parse_group(&group)?;
            let list = parse_list(&list)?;
            let active = service.get_active_exception_list(group) == list;
            println!("{} {}{}:", group, list.storage_key(), if active { " (active)" } else { "" });
            for domain in service.exception_domains(group, list) {
                println!("  {}", domain);
            }
        }
        ExceptionAction::Active { group, list } => {
            service.set_active_exception_list(parse_group(&group)?, parse_list(&list)?);
        }
    }
    Ok(())
}

fn list(service: &RuleService) {
    for group in RuleGroup::ALL {
        println!(
            "{} [{}] index {} {}",
            group,
            if service.is_rule_group_enabled(group) { "enabled" } else { "disabled" },
            service.index_status(group),
            service.index_checksum(group)
        );
        for source in service.get_rule_sources(group) {
            print_source(service, group, source.id());
        }
    }
}

fn print_source(service: &RuleService, group: RuleGroup, id: SourceId) {
    let Some(source) = service.get_rule_source(group, id) else {
        return;
    };
    let title = &source.unsafe_adblock_metadata.title;
    println!(
        "  {}  {}  {}  {} rules{}",
        id,
        source.base.origin(),
        source.last_fetch_result,
        source.rules_info.valid_rules,
        if title.is_empty() { String::new() } else { format!("  \"{}\"", title) }
    );
}

fn parse_group(s: &str) -> CliResult<RuleGroup> {
    Ok(RuleGroup::parse(s).ok_or_else(|| format!("unknown rule group: {}", s))?)
}

fn parse_list(s: &str) -> CliResult<ExceptionsList> {
    Ok(ExceptionsList::parse(s).ok_or_else(|| format!("unknown exception list: {}", s))?)
}

fn parse_id(s: &str) -> CliResult<SourceId> {
    Ok(SourceId::parse(s).ok_or_else(|| format!("invalid source id: {}", s))?)
}
