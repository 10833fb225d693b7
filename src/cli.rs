//! CLI surface (§2.1): `clap`-derive, following `octofhir-cli`'s top-level
//! `Cli` struct + per-subcommand `Args` struct pattern.

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "smart-fetch")]
#[command(about = "Extracts clinical data from a FHIR server via bulk export or crawl")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// FHIR server base URL.
    #[arg(long, global = true, env = "SMART_FETCH_URL")]
    pub fhir_url: Option<String>,

    /// Bearer token for REST calls (falls back for bulk calls too, unless
    /// `--bulk-token` is also given).
    #[arg(long, global = true, env = "SMART_FETCH_TOKEN")]
    pub bearer_token: Option<String>,

    /// Path to a file containing the bearer token (alternative to
    /// `--bearer-token`, for not leaking secrets into shell history).
    #[arg(long, global = true)]
    pub token_file: Option<String>,

    /// Separate bearer token for bulk kickoff/poll/download calls.
    #[arg(long, global = true, env = "SMART_FETCH_BULK_TOKEN")]
    pub bulk_token: Option<String>,

    /// Config profile name.
    #[arg(long, global = true, default_value = "default")]
    pub profile: String,

    /// Raise the log filter from info to debug.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format.
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum ExportMode {
    #[default]
    Auto,
    Bulk,
    Crawl,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Direct bulk-export driver.
    Bulk(BulkArgs),
    /// Direct crawl driver.
    Crawl(CrawlArgs),
    /// Managed export: picks a subfolder, chooses bulk vs. crawl, hydrates,
    /// refreshes symlinks.
    Export(ExportArgs),
    /// Run hydration tasks over an existing folder without exporting first.
    Hydrate(HydrateArgs),
    /// Fetch one resource by `Type/id` and print it.
    Single(SingleArgs),
    /// Fold a folder's NDJSON files into one `Bundle.json`.
    Bundle(BundleArgs),
    /// Re-run the symlink refresh over an existing managed folder.
    ResetSymlinks(ResetSymlinksArgs),
}

#[derive(clap::Args)]
pub struct TypeSelection {
    /// Resource type(s) to export, e.g. `--type Patient --type Observation`.
    #[arg(long = "type", required = true)]
    pub types: Vec<String>,

    /// `Type?params` filter, OR-ed with others for the same type if given
    /// multiple times.
    #[arg(long = "type-filter")]
    pub type_filters: Vec<String>,
}

#[derive(clap::Args)]
pub struct SinceSelection {
    /// Only fetch data since this timestamp, or `auto` to infer it from
    /// prior exports in the managed folder.
    #[arg(long)]
    pub since: Option<String>,

    /// How to interpret `--since`.
    #[arg(long, default_value = "auto")]
    pub since_mode: String,
}

#[derive(clap::Args)]
pub struct CohortSelection {
    /// Group/cohort ID on the server (bulk Group-level export).
    #[arg(long)]
    pub group: Option<String>,

    /// Explicit patient ID, repeatable.
    #[arg(long = "id")]
    pub ids: Vec<String>,

    /// File of patient IDs (newline-delimited, or CSV with an id/mrn
    /// column).
    #[arg(long)]
    pub id_file: Option<String>,

    /// File of MRNs to resolve via `identifier=system|mrn` search.
    #[arg(long)]
    pub mrn_file: Option<String>,

    /// Identifier system used with `--mrn-file`.
    #[arg(long)]
    pub mrn_system: Option<String>,
}

#[derive(clap::Args)]
pub struct BulkArgs {
    /// Destination folder for exported NDJSON files.
    pub dest: String,
    #[command(flatten)]
    pub types: TypeSelection,
    #[command(flatten)]
    pub since: SinceSelection,
    #[arg(long)]
    pub group: Option<String>,
    /// Cancel an in-flight export instead of starting/resuming one.
    #[arg(long)]
    pub cancel: bool,
}

#[derive(clap::Args)]
pub struct CrawlArgs {
    pub dest: String,
    #[command(flatten)]
    pub types: TypeSelection,
    #[command(flatten)]
    pub since: SinceSelection,
    #[command(flatten)]
    pub cohort: CohortSelection,
}

#[derive(clap::Args)]
pub struct ExportArgs {
    /// Managed root folder.
    #[arg(long = "dir")]
    pub dir: String,
    #[command(flatten)]
    pub types: TypeSelection,
    #[command(flatten)]
    pub since: SinceSelection,
    #[command(flatten)]
    pub cohort: CohortSelection,
    /// Nickname for this run's subfolder.
    #[arg(long)]
    pub nickname: Option<String>,
    #[arg(long, default_value = "auto")]
    pub mode: ExportMode,
}

#[derive(clap::Args)]
pub struct HydrateArgs {
    /// Folder to hydrate in place.
    pub workdir: String,
    /// Restrict to specific hydration task names (default: all applicable).
    #[arg(long = "hydration-task")]
    pub hydration_tasks: Vec<String>,
    /// Read input resources from a different folder than `workdir` (so
    /// hydration output only affects this subfolder, not the source it read
    /// from).
    #[arg(long)]
    pub source_dir: Option<String>,
    /// Attachment MIME types to inline (comma-separated).
    #[arg(long)]
    pub mimetypes: Option<String>,
}

#[derive(clap::Args)]
pub struct SingleArgs {
    /// `Type/id`, e.g. `Patient/123`.
    pub reference: String,
}

#[derive(clap::Args)]
pub struct BundleArgs {
    /// Folder of `Type.ndjson[.gz]` files.
    pub source_dir: String,
    /// Output path for the combined `Bundle.json`.
    #[arg(long, default_value = "Bundle.json")]
    pub output: String,
}

#[derive(clap::Args)]
pub struct ResetSymlinksArgs {
    /// Managed root folder.
    pub dir: String,
}
