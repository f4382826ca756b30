//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use kbingest_core::{
    Collaborators, IngestOptions, LocalFileStorage, Orchestrator, ProcessingResult,
    RepositoryChangeDetector, TagQuery,
};
use kbingest_extract::ContentExtractor;
use kbingest_fetch::{HttpFetcher, RateLimiter, UrlClassifier};
use kbingest_shared::{
    AppConfig, FetchConfig, Metadata, NewTag, PipelineConfig, RateLimitConfig, Tag, TagFilter,
    TagUpdate, UrlFilter, UrlStatus, init_config, load_config,
};
use kbingest_storage::{ScraperParamStore, Storage, TagManager, UrlRepository};
use serde_json::json;
use tracing::info;

use crate::progress::CliProgress;

const DB_FILE_NAME: &str = "kbingest.db";

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// kbingest — ingest URLs into a local knowledge store.
#[derive(Parser)]
#[command(
    name = "kbingest",
    version,
    about = "Fetch, deduplicate, extract and index web content into a local knowledge store.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Flags shared by the ingesting commands.
#[derive(clap::Args, Debug, Clone)]
pub(crate) struct RunFlags {
    /// Process even when content is unchanged since the last run.
    #[arg(long)]
    pub force: bool,

    /// Index content even if another URL already holds it.
    #[arg(long)]
    pub no_dedup: bool,

    /// URLs processed concurrently.
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Per-request timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Print results as JSON.
    #[arg(long)]
    pub json: bool,
}

impl RunFlags {
    fn options(&self) -> IngestOptions {
        IngestOptions {
            force_reprocess: self.force,
            detect_duplicates: self.no_dedup.then_some(false),
            concurrency: self.concurrency,
            timeout: self.timeout.map(Duration::from_secs),
            ..IngestOptions::default()
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Ingest one or more URLs.
    Ingest {
        /// URLs to ingest.
        #[arg(required = true)]
        urls: Vec<String>,

        /// Tag to attach (repeatable; created if missing).
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        #[command(flatten)]
        flags: RunFlags,
    },

    /// Re-run the pipeline for the URL behind a knowledge entry.
    Reprocess {
        /// Knowledge entry id.
        entry_id: String,

        #[command(flatten)]
        flags: RunFlags,
    },

    /// Ingest every URL carrying the given tags.
    IngestTags {
        /// Tag names.
        #[arg(required = true)]
        tags: Vec<String>,

        /// Also match URLs tagged with descendant tags.
        #[arg(long)]
        descendants: bool,

        /// Require all tags instead of any.
        #[arg(long)]
        all: bool,

        #[command(flatten)]
        flags: RunFlags,
    },

    /// Inspect and manage tracked URLs.
    Urls {
        #[command(subcommand)]
        action: UrlsAction,
    },

    /// Manage the tag hierarchy.
    Tags {
        #[command(subcommand)]
        action: TagsAction,
    },

    /// Manage stored scraper parameters.
    Params {
        #[command(subcommand)]
        action: ParamsAction,
    },

    /// Full-text search over indexed content.
    Search {
        /// FTS5 query.
        query: String,

        /// Maximum number of hits.
        #[arg(short, long, default_value = "10")]
        limit: u32,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// URL subcommands.
#[derive(Subcommand)]
pub(crate) enum UrlsAction {
    /// List tracked URLs.
    List {
        /// Only URLs with this status.
        #[arg(long)]
        status: Option<String>,

        /// Substring of the normalized URL.
        #[arg(long)]
        search: Option<String>,

        #[arg(long)]
        limit: Option<u32>,

        #[arg(long)]
        offset: Option<u32>,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show one URL with its tags and entries.
    Show { url: String },
    /// Forget a URL (its tag links and entries go with it).
    Remove { url: String },
    /// Count URLs per status.
    Stats,
}

/// Tag subcommands.
#[derive(Subcommand)]
pub(crate) enum TagsAction {
    /// Create a tag.
    Create {
        name: String,

        /// Parent tag name.
        #[arg(long)]
        parent: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        color: Option<String>,
    },
    /// List tags.
    List {
        /// Only children of this tag.
        #[arg(long, conflicts_with = "roots")]
        parent: Option<String>,

        /// Only root tags.
        #[arg(long)]
        roots: bool,

        /// Substring of the tag name.
        #[arg(long)]
        search: Option<String>,
    },
    /// Delete a tag; children are promoted to roots unless `--cascade`.
    Delete {
        name: String,

        /// Delete the whole subtree.
        #[arg(long)]
        cascade: bool,
    },
    /// Print the root-to-tag path.
    Path { name: String },
    /// Move a tag under a new parent, or to the root with `--root`.
    Move {
        name: String,

        #[arg(long, conflicts_with = "root", required_unless_present = "root")]
        parent: Option<String>,

        #[arg(long)]
        root: bool,
    },
    /// Rename a tag.
    Rename { name: String, new_name: String },
}

/// Scraper parameter subcommands.
#[derive(Subcommand)]
pub(crate) enum ParamsAction {
    /// Store parameters for a URL.
    Set {
        url: String,

        /// Scraper the parameters are meant for.
        #[arg(long)]
        scraper: String,

        /// Parameters as a JSON object.
        #[arg(long)]
        params: String,
    },
    /// Show stored parameters for a URL.
    Show { url: String },
    /// Remove stored parameters for a URL.
    Remove { url: String },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so JSON results
/// on stdout stay parseable.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "kbingest=warn",
        1 => "kbingest=info",
        2 => "kbingest=debug",
        _ => "kbingest=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = load_config()?;

    match cli.command {
        Command::Ingest { urls, tags, flags } => cmd_ingest(&config, &urls, &tags, &flags).await,
        Command::Reprocess { entry_id, flags } => cmd_reprocess(&config, &entry_id, &flags).await,
        Command::IngestTags {
            tags,
            descendants,
            all,
            flags,
        } => {
            let query = TagQuery {
                include_descendants: descendants,
                require_all: all,
            };
            cmd_ingest_tags(&config, &tags, query, &flags).await
        }
        Command::Urls { action } => cmd_urls(&config, action).await,
        Command::Tags { action } => cmd_tags(&config, action).await,
        Command::Params { action } => cmd_params(&config, action).await,
        Command::Search { query, limit } => cmd_search(&config, &query, limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&config),
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn db_path(config: &AppConfig) -> Result<PathBuf> {
    Ok(config.data_dir()?.join(DB_FILE_NAME))
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let path = db_path(config)?;
    Storage::open(&path)
        .await
        .wrap_err_with(|| format!("failed to open database at {}", path.display()))
}

async fn open_storage_readonly(config: &AppConfig) -> Result<Storage> {
    let path = db_path(config)?;
    Storage::open_readonly(&path)
        .await
        .wrap_err("nothing ingested yet; run `kbingest ingest <URL>` first")
}

/// Build an orchestrator with the default HTTP, extraction and libSQL backends.
fn build_orchestrator(
    config: &AppConfig,
    storage: &Storage,
    progress: Arc<CliProgress>,
) -> Result<Orchestrator> {
    let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::from(config)));
    let fetcher = HttpFetcher::new(FetchConfig::from(config), limiter)?;

    let collaborators = Collaborators {
        classifier: Arc::new(UrlClassifier::new()),
        fetcher: Arc::new(fetcher),
        processor: Arc::new(ContentExtractor::new()),
        knowledge: Arc::new(storage.clone()),
        files: Arc::new(LocalFileStorage::new(config.data_dir()?.join("files"))),
        change_detector: Some(Arc::new(RepositoryChangeDetector::new(UrlRepository::new(
            storage.clone(),
        )))),
        file_tracker: Some(Arc::new(storage.clone())),
    };

    let params = ScraperParamStore::new(storage.clone(), config.params_ttl());
    Ok(
        Orchestrator::new(storage.clone(), collaborators, PipelineConfig::from(config))
            .with_param_store(params)
            .with_progress(progress),
    )
}

// ---------------------------------------------------------------------------
// Ingestion commands
// ---------------------------------------------------------------------------

async fn cmd_ingest(
    config: &AppConfig,
    urls: &[String],
    tags: &[String],
    flags: &RunFlags,
) -> Result<()> {
    let storage = open_storage(config).await?;
    let progress = Arc::new(CliProgress::new(urls.len(), flags.json));
    let orchestrator = build_orchestrator(config, &storage, progress.clone())?;
    let options = flags.options();

    info!(count = urls.len(), tags = tags.len(), "ingesting URLs");

    let results = if tags.is_empty() {
        orchestrator.process_urls(urls, &options).await
    } else {
        let mut results = Vec::with_capacity(urls.len());
        for url in urls {
            results.push(orchestrator.process_url_with_tags(url, tags, &options).await);
        }
        results
    };
    progress.finish();

    report(&results, flags.json)
}

async fn cmd_reprocess(config: &AppConfig, entry_id: &str, flags: &RunFlags) -> Result<()> {
    let storage = open_storage(config).await?;
    let progress = Arc::new(CliProgress::new(1, flags.json));
    let orchestrator = build_orchestrator(config, &storage, progress.clone())?;

    let result = orchestrator
        .reprocess_entry(entry_id, &flags.options())
        .await;
    progress.finish();

    report(&[result?], flags.json)
}

async fn cmd_ingest_tags(
    config: &AppConfig,
    tags: &[String],
    query: TagQuery,
    flags: &RunFlags,
) -> Result<()> {
    let storage = open_storage(config).await?;
    let progress = Arc::new(CliProgress::new(0, flags.json));
    let orchestrator = build_orchestrator(config, &storage, progress.clone())?;

    let results = orchestrator
        .process_urls_by_tags(tags, query, &flags.options())
        .await;
    progress.finish();

    let results = results?;
    if results.is_empty() && !flags.json {
        println!("No URLs carry the requested tags.");
        return Ok(());
    }
    report(&results, flags.json)
}

/// Print results and fail when any URL failed outright.
fn report(results: &[ProcessingResult], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
    } else {
        for result in results {
            print_result(result);
        }
    }

    let failed = results
        .iter()
        .filter(|r| !r.success && !r.skipped)
        .count();
    let skipped = results.iter().filter(|r| r.skipped).count();

    if !json {
        println!();
        println!(
            "  {} indexed, {skipped} skipped, {failed} failed",
            results.len() - failed - skipped
        );
    }

    if failed > 0 {
        return Err(eyre!("{failed} of {} URLs failed", results.len()));
    }
    Ok(())
}

fn print_result(result: &ProcessingResult) {
    let tags = if result.tags.is_empty() {
        String::new()
    } else {
        format!("  [{}]", result.tags.join(", "))
    };

    match (result.success, result.skipped, &result.error) {
        (true, false, _) => println!(
            "  indexed    {}  {}{tags}",
            result.url,
            result.entry_id.as_deref().unwrap_or("-")
        ),
        (true, true, _) => println!("  unchanged  {}{tags}", result.url),
        (false, _, Some(err)) => println!(
            "  {:<10} {}  [{}] {}: {}",
            if result.skipped { "skipped" } else { "failed" },
            result.url,
            err.stage,
            err.code,
            err.message
        ),
        (false, _, None) => println!("  failed     {}", result.url),
    }
}

// ---------------------------------------------------------------------------
// URLs
// ---------------------------------------------------------------------------

async fn cmd_urls(config: &AppConfig, action: UrlsAction) -> Result<()> {
    match action {
        UrlsAction::List {
            status,
            search,
            limit,
            offset,
            json,
        } => {
            let storage = open_storage_readonly(config).await?;
            let repo = UrlRepository::new(storage);
            let filter = UrlFilter {
                status: status.as_deref().map(str::parse::<UrlStatus>).transpose()?,
                search,
                limit,
                offset,
            };
            let records = repo.list(&filter).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
                return Ok(());
            }
            if records.is_empty() {
                println!("No URLs tracked.");
                return Ok(());
            }
            for record in &records {
                println!(
                    "  {:<10} v{:<3} {}",
                    record.status, record.content_version, record.url
                );
            }
            println!();
            println!("  {} URL(s)", records.len());
        }
        UrlsAction::Show { url } => {
            let storage = open_storage_readonly(config).await?;
            let repo = UrlRepository::new(storage.clone());
            let record = repo
                .get_url_info(&url)
                .await?
                .ok_or_else(|| eyre!("URL not tracked: {url}"))?;
            let tags = repo.tags_for_url(&record.id).await?;
            let entries: Vec<_> = storage
                .list_entries_for_url(&record.id)
                .await?
                .into_iter()
                .map(|e| json!({ "id": e.id, "title": e.title, "checksum": e.checksum, "updated_at": e.updated_at }))
                .collect();
            let original_files = storage.count_original_files(&record.id).await?;

            let view = json!({
                "url": record,
                "tags": tags,
                "entries": entries,
                "original_files": original_files,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        UrlsAction::Remove { url } => {
            let repo = UrlRepository::new(open_storage(config).await?);
            let record = repo
                .get_url_info(&url)
                .await?
                .ok_or_else(|| eyre!("URL not tracked: {url}"))?;
            repo.remove(&record.id).await?;
            println!("Removed {}", record.url);
        }
        UrlsAction::Stats => {
            let storage = open_storage_readonly(config).await?;
            let counts = UrlRepository::new(storage.clone()).status_counts().await?;
            for (status, count) in &counts {
                println!("  {status:<10} {count}");
            }
            println!("  {:<10} {}", "entries", storage.count_entries().await?);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

async fn tag_by_name(tags: &TagManager, name: &str) -> Result<Tag> {
    tags.get_tag_by_name(name)
        .await?
        .ok_or_else(|| eyre!("unknown tag '{name}'"))
}

async fn cmd_tags(config: &AppConfig, action: TagsAction) -> Result<()> {
    let tags = TagManager::new(open_storage(config).await?);

    match action {
        TagsAction::Create {
            name,
            parent,
            description,
            color,
        } => {
            let parent_id = match parent {
                Some(parent) => Some(tag_by_name(&tags, &parent).await?.id),
                None => None,
            };
            let tag = tags
                .create_tag(NewTag {
                    name,
                    parent_id,
                    description,
                    color,
                })
                .await?;
            println!("Created tag '{}' ({})", tag.name, tag.id);
        }
        TagsAction::List {
            parent,
            roots,
            search,
        } => {
            let parent_id = match (parent, roots) {
                (Some(parent), _) => Some(Some(tag_by_name(&tags, &parent).await?.id)),
                (None, true) => Some(None),
                (None, false) => None,
            };
            let list = tags.list_tags(&TagFilter { parent_id, search }).await?;
            if list.is_empty() {
                println!("No tags.");
            }
            for tag in &list {
                let path = tags
                    .get_tag_path(&tag.id)
                    .await?
                    .into_iter()
                    .map(|t| t.name)
                    .collect::<Vec<_>>()
                    .join(" / ");
                match &tag.description {
                    Some(description) => println!("  {path}  - {description}"),
                    None => println!("  {path}"),
                }
            }
        }
        TagsAction::Delete { name, cascade } => {
            let tag = tag_by_name(&tags, &name).await?;
            let children = tags.get_child_tags(&tag.id, cascade).await?.len();
            tags.delete_tag(&tag.id, cascade).await?;
            if cascade {
                println!("Deleted '{}' and {children} descendant tag(s)", tag.name);
            } else {
                println!("Deleted '{}'; {children} child tag(s) moved to root", tag.name);
            }
        }
        TagsAction::Path { name } => {
            let tag = tag_by_name(&tags, &name).await?;
            let path: Vec<String> = tags
                .get_tag_path(&tag.id)
                .await?
                .into_iter()
                .map(|t| t.name)
                .collect();
            println!("{}", path.join(" / "));
        }
        TagsAction::Move { name, parent, root } => {
            let tag = tag_by_name(&tags, &name).await?;
            let parent_id = match (parent, root) {
                (Some(parent), false) => Some(tag_by_name(&tags, &parent).await?.id),
                _ => None,
            };
            tags.update_tag(
                &tag.id,
                TagUpdate {
                    parent_id: Some(parent_id),
                    ..TagUpdate::default()
                },
            )
            .await?;
            println!("Moved '{}'", tag.name);
        }
        TagsAction::Rename { name, new_name } => {
            let tag = tag_by_name(&tags, &name).await?;
            if !tags.is_name_available(&new_name, Some(&tag.id)).await? {
                return Err(eyre!("tag name '{new_name}' is already taken"));
            }
            let updated = tags
                .update_tag(
                    &tag.id,
                    TagUpdate {
                        name: Some(new_name),
                        ..TagUpdate::default()
                    },
                )
                .await?;
            println!("Renamed '{}' to '{}'", tag.name, updated.name);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Scraper params
// ---------------------------------------------------------------------------

async fn cmd_params(config: &AppConfig, action: ParamsAction) -> Result<()> {
    let store = ScraperParamStore::new(open_storage(config).await?, config.params_ttl());

    match action {
        ParamsAction::Set {
            url,
            scraper,
            params,
        } => {
            let params: Metadata =
                serde_json::from_str(&params).wrap_err("--params must be a JSON object")?;
            let stored = store.set(&url, &scraper, params).await?;
            println!("Stored {} parameters for {}", stored.scraper_type, stored.url);
        }
        ParamsAction::Show { url } => match store.get(&url).await? {
            Some(stored) => println!("{}", serde_json::to_string_pretty(&stored)?),
            None => println!("No parameters stored for {url}"),
        },
        ParamsAction::Remove { url } => {
            if store.remove(&url).await? {
                println!("Removed parameters for {url}");
            } else {
                println!("No parameters stored for {url}");
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Search & config
// ---------------------------------------------------------------------------

async fn cmd_search(config: &AppConfig, query: &str, limit: u32) -> Result<()> {
    let storage = open_storage_readonly(config).await?;
    let hits = storage.search_entries(query, limit).await?;
    if hits.is_empty() {
        println!("No matches.");
        return Ok(());
    }
    for hit in &hits {
        println!("  {}  {}", hit.title, hit.url);
        println!("    {}", hit.snippet.replace('\n', " "));
        println!("    entry: {}", hit.entry_id);
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_map_to_options() {
        let cli = Cli::parse_from([
            "kbingest",
            "ingest",
            "https://a.com/",
            "--tag",
            "docs",
            "--no-dedup",
            "--force",
            "-c",
            "3",
        ]);
        let Command::Ingest { urls, tags, flags } = cli.command else {
            panic!("expected ingest");
        };
        assert_eq!(urls, vec!["https://a.com/"]);
        assert_eq!(tags, vec!["docs"]);

        let options = flags.options();
        assert!(options.force_reprocess);
        assert_eq!(options.detect_duplicates, Some(false));
        assert_eq!(options.concurrency, Some(3));
    }

    #[test]
    fn dedup_defaults_to_config() {
        let cli = Cli::parse_from(["kbingest", "ingest", "https://a.com/"]);
        let Command::Ingest { flags, .. } = cli.command else {
            panic!("expected ingest");
        };
        assert_eq!(flags.options().detect_duplicates, None);
    }
}
