mod auth;
mod bulk;
mod client;
mod cli;
mod cohort;
mod concurrency;
mod config;
mod crawl;
mod error;
mod filtering;
mod hydrate;
mod managed;
mod merges;
mod metadata;
mod ndjson;
mod output;
mod resources;
mod symlinks;
mod timing;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use auth::AuthContext;
use cli::{Cli, Commands, ExportMode};
use client::FhirClient;
use error::CliError;
use metadata::{ManagedMetadata, OutputMetadata};

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let runtime = tokio::runtime::Runtime::new().expect("failed to start async runtime");
    let exit_code = match runtime.block_on(run(cli)) {
        Ok(()) => 0,
        Err(err) => {
            output::print_error(&err.to_string());
            err.exit_code()
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing(verbose: bool, format: cli::LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if format == cli::LogFormat::Json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn auth_context(cli: &Cli) -> Result<AuthContext, CliError> {
    let rest_token = match &cli.token_file {
        Some(path) => Some(std::fs::read_to_string(path).map_err(|e| CliError::Other(e.into()))?.trim().to_string()),
        None => cli.bearer_token.clone(),
    };
    Ok(AuthContext { rest_token, bulk_token: cli.bulk_token.clone() })
}

/// `--fhir-url`, falling back to the profile's stored URL.
fn resolve_fhir_url(cli: &Cli, profile: &config::ProfileConfig) -> Result<String, CliError> {
    cli.fhir_url
        .clone()
        .or_else(|| profile.fhir_url.clone())
        .ok_or_else(|| CliError::UserError("--fhir-url is required (or set SMART_FETCH_URL, or save it in the profile)".to_string()))
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let ctx = auth_context(&cli)?;
    let profile = config::load_profile(&cli.profile).map_err(CliError::Other)?;

    match &cli.command {
        Commands::Bulk(args) => run_bulk_command(&cli, &ctx, &profile, args).await,
        Commands::Crawl(args) => run_crawl_command(&cli, &ctx, &profile, args).await,
        Commands::Export(args) => run_export_command(&cli, &ctx, &profile, args).await,
        Commands::Hydrate(args) => run_hydrate_command(&cli, &ctx, &profile, args).await,
        Commands::Single(args) => run_single_command(&cli, &ctx, &profile, args).await,
        Commands::Bundle(args) => run_bundle_command(args).await,
        Commands::ResetSymlinks(args) => run_reset_symlinks_command(args).await,
    }
}

fn since_mode_arg(raw: &str) -> Result<filtering::SinceMode, CliError> {
    filtering::SinceMode::parse(raw).ok_or_else(|| CliError::UserError(format!("invalid --since-mode '{raw}'")))
}

async fn run_bulk_command(cli: &Cli, ctx: &AuthContext, profile: &config::ProfileConfig, args: &cli::BulkArgs) -> Result<(), CliError> {
    let fhir_url = resolve_fhir_url(cli, profile)?;
    let dest = PathBuf::from(&args.dest);
    let requested_since_mode = since_mode_arg(&args.since.since_mode)?;
    let client = FhirClient::new(&fhir_url, ctx.bulk_header());

    let since_mode = requested_since_mode.resolve(profile.epic);
    // `base_filters` carries no baked-in since value and is the stable
    // identity recorded in metadata; `filters` is the one actually queried
    // with, which for `created` mode has the per-type date clause baked in.
    let base_filters = filtering::build_filters(&args.types.types, &args.types.type_filters, since_mode, profile.epic, None)
        .map_err(|e| CliError::UserError(e.to_string()))?;
    let filters = filtering::build_filters(
        &args.types.types,
        &args.types.type_filters,
        since_mode,
        profile.epic,
        args.since.since.as_deref(),
    )
    .map_err(|e| CliError::UserError(e.to_string()))?;

    let mut metadata = OutputMetadata::load(&dest).await.map_err(|e| CliError::Other(e.into()))?;
    metadata
        .note_context(&base_filters, args.since.since.as_deref(), since_mode)
        .await
        .map_err(|e| CliError::Other(e.into()))?;

    if args.cancel {
        if let Some(url) = metadata.get_bulk_status_url() {
            client.delete(url).await.map_err(|e| CliError::Other(anyhow::anyhow!(e.to_string())))?;
        }
        output::print_success("Export cancelled.");
        return Ok(());
    }

    let bulk_since = filtering::bulk_since(since_mode, args.since.since.as_deref());
    let result = bulk::run_bulk_export(&client, &dest, &fhir_url, args.group.as_deref(), &filters, bulk_since.as_deref(), &mut metadata, bulk::DEFAULT_TIMEOUT)
        .await
        .map_err(|e| CliError::Other(anyhow::anyhow!(e.to_string())))?;

    for res_type in filters.keys() {
        metadata.mark_done(res_type, &result.transaction_time).await.map_err(|e| CliError::Other(e.into()))?;
    }
    metadata.mark_complete().await.map_err(|e| CliError::Other(e.into()))?;

    if result.had_fatal_errors {
        return Err(CliError::Other(anyhow::anyhow!("export completed with fatal errors logged under error/")));
    }
    output::print_success(&format!("Bulk export complete. Transaction time: {}", result.transaction_time));
    Ok(())
}

async fn run_crawl_command(cli: &Cli, ctx: &AuthContext, profile: &config::ProfileConfig, args: &cli::CrawlArgs) -> Result<(), CliError> {
    let fhir_url = resolve_fhir_url(cli, profile)?;
    let dest = PathBuf::from(&args.dest);
    let requested_since_mode = since_mode_arg(&args.since.since_mode)?;
    let client = FhirClient::new(&fhir_url, ctx.rest_header());
    let since_mode = requested_since_mode.resolve(profile.epic);

    let base_filters = filtering::build_filters(&args.types.types, &args.types.type_filters, since_mode, profile.epic, None)
        .map_err(|e| CliError::UserError(e.to_string()))?;
    let filters = filtering::build_filters(
        &args.types.types,
        &args.types.type_filters,
        since_mode,
        profile.epic,
        args.since.since.as_deref(),
    )
    .map_err(|e| CliError::UserError(e.to_string()))?;
    let search_filters = filtering::params_for_search(&filters, since_mode, args.since.since.as_deref());

    let patient_ids = resolve_cohort(&client, &args.cohort, &fhir_url).await?;

    let mut metadata = OutputMetadata::load(&dest).await.map_err(|e| CliError::Other(e.into()))?;
    metadata
        .note_context(&base_filters, args.since.since.as_deref(), since_mode)
        .await
        .map_err(|e| CliError::Other(e.into()))?;

    run_crawl_into(&client, &fhir_url, &dest, &search_filters, &patient_ids, &mut metadata).await?;

    metadata.mark_complete().await.map_err(|e| CliError::Other(e.into()))?;
    output::print_success("Crawl complete.");
    Ok(())
}

/// Shared crawl-execution body used by both the standalone `crawl` command
/// and `export`'s crawl path: runs every requested type through the bounded
/// pipeline, records per-type done-timestamps, and writes the fake log.
async fn run_crawl_into(
    client: &FhirClient,
    fhir_url: &str,
    workdir: &Path,
    search_filters: &filtering::Filters,
    patient_ids: &[String],
    metadata: &mut OutputMetadata,
) -> Result<(), CliError> {
    let crawl_start = timing::now();
    let transaction_times = std::sync::Arc::new(crawl::TransactionTimes::default());

    for (res_type, params) in search_filters {
        let path = workdir.join(format!("{res_type}.ndjson.gz"));
        let error_path = workdir.join("error").join("OperationOutcome.ndjson.gz");
        let writer = std::sync::Arc::new(tokio::sync::Mutex::new(ndjson::NdjsonWriter::new(&path, false)));
        let error_writer = std::sync::Arc::new(tokio::sync::Mutex::new(ndjson::NdjsonWriter::new(&error_path, true)));

        let id_pool = if crawl::needs_id_pool(params) { Some(std::sync::Arc::new(crawl::IdPool::new())) } else { None };

        let urls = crawl::resource_urls_with_new_patients(fhir_url, res_type, params, patient_ids, &[], None);

        crawl::crawl_type(client, res_type, urls, writer.clone(), error_writer.clone(), id_pool, transaction_times.clone(), crawl_start)
            .await
            .map_err(|e| CliError::Other(anyhow::anyhow!(e.to_string())))?;

        let done = transaction_times.done_timestamp(res_type, crawl_start);
        metadata.mark_done(res_type, &done).await.map_err(|e| CliError::Other(e.into()))?;

        let writer = std::sync::Arc::try_unwrap(writer).ok().expect("no outstanding references after crawl_type completes").into_inner();
        writer.close().await.map_err(|e| CliError::Other(e.into()))?;
        let error_writer = std::sync::Arc::try_unwrap(error_writer).ok().expect("no outstanding references after crawl_type completes").into_inner();
        error_writer.close().await.map_err(|e| CliError::Other(e.into()))?;
    }

    let types: Vec<String> = search_filters.keys().cloned().collect();
    crawl::create_fake_log(workdir, &types, &timing::now().to_rfc3339())
        .await
        .map_err(|e| CliError::Other(anyhow::anyhow!(e.to_string())))?;
    Ok(())
}

async fn resolve_cohort(client: &FhirClient, cohort: &cli::CohortSelection, fhir_url: &str) -> Result<Vec<String>, CliError> {
    let mut ids: BTreeSet<String> = cohort.ids.iter().cloned().collect();

    if let Some(id_file) = &cohort.id_file {
        ids.extend(cohort::load_ids(Path::new(id_file)).map_err(|e| CliError::Other(e.into()))?);
    }

    if let Some(mrn_file) = &cohort.mrn_file {
        let mrns = cohort::load_ids(Path::new(mrn_file)).map_err(|e| CliError::Other(e.into()))?;
        let system = cohort.mrn_system.as_deref().unwrap_or("http://hl7.org/fhir/sid/us-mrn");
        for mrn in mrns {
            let url = format!("{}/Patient?identifier={system}|{mrn}", fhir_url.trim_end_matches('/'));
            let bundle = client.search(&url).await.map_err(|e| CliError::Other(anyhow::anyhow!(e.to_string())))?;
            for entry in bundle.get("entry").and_then(|v| v.as_array()).into_iter().flatten() {
                if let Some(id) = entry.pointer("/resource/id").and_then(|v| v.as_str()) {
                    ids.insert(id.to_string());
                }
            }
        }
    }

    let _ = cohort.group;
    Ok(ids.into_iter().collect())
}

async fn run_export_command(cli: &Cli, ctx: &AuthContext, profile: &config::ProfileConfig, args: &cli::ExportArgs) -> Result<(), CliError> {
    let fhir_url = resolve_fhir_url(cli, profile)?;
    let source_dir = PathBuf::from(&args.dir);
    let requested_since_mode = since_mode_arg(&args.since.since_mode)?;

    let mut managed = ManagedMetadata::load(&source_dir).await.map_err(|e| CliError::Other(e.into()))?;
    managed.note_context(&fhir_url, args.cohort.group.as_deref()).await.map_err(|e| CliError::Other(e.into()))?;

    let since_mode = requested_since_mode.resolve(profile.epic);
    // Built without a concrete `since` value: used for auto-since lookup and
    // subfolder-reuse matching, which compare type/param identity across
    // runs and must not vary with a baked-in created-mode timestamp.
    let base_filters = filtering::build_filters(&args.types.types, &args.types.type_filters, since_mode, profile.epic, None)
        .map_err(|e| CliError::UserError(e.to_string()))?;

    let since = match args.since.since.as_deref() {
        Some("auto") => Some(managed::auto_since(&source_dir, &base_filters, since_mode).await?),
        other => other.map(str::to_string),
    };

    let subfolder = managed::resolve_workdir(&source_dir, &base_filters, since.as_deref(), since_mode, args.nickname.as_deref()).await?;
    let workdir = source_dir.join(&subfolder);

    let filters = filtering::build_filters(
        &args.types.types,
        &args.types.type_filters,
        since_mode,
        profile.epic,
        since.as_deref(),
    )
    .map_err(|e| CliError::UserError(e.to_string()))?;

    let export_mode = match args.mode {
        ExportMode::Auto if profile.epic => ExportMode::Crawl,
        ExportMode::Auto => ExportMode::Bulk,
        other => other,
    };

    let mut metadata = OutputMetadata::load(&workdir).await.map_err(|e| CliError::Other(e.into()))?;
    metadata.note_context(&base_filters, since.as_deref(), since_mode).await.map_err(|e| CliError::Other(e.into()))?;

    if export_mode == ExportMode::Bulk {
        let client = FhirClient::new(&fhir_url, ctx.bulk_header());
        let bulk_since = filtering::bulk_since(since_mode, since.as_deref());
        let result = bulk::run_bulk_export(&client, &workdir, &fhir_url, args.cohort.group.as_deref(), &filters, bulk_since.as_deref(), &mut metadata, bulk::DEFAULT_TIMEOUT)
            .await
            .map_err(|e| CliError::Other(anyhow::anyhow!(e.to_string())))?;
        for res_type in filters.keys() {
            metadata.mark_done(res_type, &result.transaction_time).await.map_err(|e| CliError::Other(e.into()))?;
        }
    } else {
        let client = FhirClient::new(&fhir_url, ctx.rest_header());
        let search_filters = filtering::params_for_search(&filters, since_mode, since.as_deref());
        let patient_ids = resolve_cohort(&client, &args.cohort, &fhir_url).await?;
        run_crawl_into(&client, &fhir_url, &workdir, &search_filters, &patient_ids, &mut metadata).await?;
    }
    metadata.mark_complete().await.map_err(|e| CliError::Other(e.into()))?;

    let hydrate_client = FhirClient::new(&fhir_url, ctx.rest_header());
    let requested_types: Vec<String> = filters.keys().cloned().collect();
    hydrate::run_pending_loop(&hydrate_client, &workdir, &requested_types, &hydrate::default_mimetypes())
        .await
        .map_err(|e| CliError::Other(anyhow::anyhow!(e.to_string())))?;

    if requested_types.iter().any(|t| t == resources::PATIENT) {
        detect_patient_delta(&source_dir, &subfolder, &workdir).await?;
    }

    refresh_symlinks(&source_dir).await?;

    output::print_success(&format!("Export complete in {subfolder}."));
    Ok(())
}

/// Reads the just-completed subfolder's `Patient` export against the most
/// recent prior subfolder's (excluding itself), records newly-seen patient
/// IDs on this subfolder's metadata, and writes a delete-Bundle ndjson for
/// any patient that disappeared.
async fn detect_patient_delta(source_dir: &Path, current_subfolder: &str, workdir: &Path) -> Result<(), CliError> {
    let current_patients = read_patient_file(workdir).await?;

    let prior_folder = managed::list_workdirs(source_dir).into_iter().find(|w| w.folder != current_subfolder);
    let prior_patients = match prior_folder {
        Some(entry) => read_patient_file(&source_dir.join(&entry.folder)).await?,
        None => Vec::new(),
    };

    let (new_ids, deleted_ids) = merges::find_new_patients(&prior_patients, &current_patients);

    let mut metadata = OutputMetadata::load(workdir).await.map_err(|e| CliError::Other(e.into()))?;
    metadata.note_new_patients(&new_ids).await.map_err(|e| CliError::Other(e.into()))?;

    if !deleted_ids.is_empty() {
        let deleted_path = workdir.join("deleted").join(format!("{}.ndjson.gz", resources::PATIENT));
        let mut writer = ndjson::NdjsonWriter::new(&deleted_path, false);
        for id in &deleted_ids {
            writer
                .write(&merges::delete_bundle(resources::PATIENT, id))
                .await
                .map_err(|e| CliError::Other(e.into()))?;
        }
        writer.close().await.map_err(|e| CliError::Other(e.into()))?;
    }

    Ok(())
}

async fn read_patient_file(workdir: &Path) -> Result<Vec<serde_json::Value>, CliError> {
    let plain = workdir.join(format!("{}.ndjson", resources::PATIENT));
    let path = if plain.exists() { plain } else { workdir.join(format!("{}.ndjson.gz", resources::PATIENT)) };
    if !path.exists() {
        return Ok(Vec::new());
    }
    ndjson::read_values(&path).await.map_err(|e| CliError::Other(e.into()))
}

async fn run_hydrate_command(cli: &Cli, ctx: &AuthContext, profile: &config::ProfileConfig, args: &cli::HydrateArgs) -> Result<(), CliError> {
    let fhir_url = resolve_fhir_url(cli, profile)?;
    let client = FhirClient::new(&fhir_url, ctx.rest_header());
    let workdir = PathBuf::from(&args.workdir);
    let source_dir = args.source_dir.as_deref().map(PathBuf::from).unwrap_or_else(|| workdir.clone());
    let mimetypes = hydrate::parse_mimetypes(args.mimetypes.as_deref());

    let all_tasks = hydrate::all_tasks(&mimetypes);
    for task in &all_tasks {
        if !args.hydration_tasks.is_empty() && !args.hydration_tasks.iter().any(|n| n == task.name()) {
            continue;
        }
        if let Some(stats) = hydrate::process(&client, &source_dir, &workdir, task.as_ref())
            .await
            .map_err(|e| CliError::Other(anyhow::anyhow!(e.to_string())))?
        {
            output::print_task_stats(task.name(), "hydrated", task.input_type(), None, &stats);
        }
    }

    output::print_success("Hydration complete.");
    Ok(())
}

async fn run_single_command(cli: &Cli, ctx: &AuthContext, profile: &config::ProfileConfig, args: &cli::SingleArgs) -> Result<(), CliError> {
    let fhir_url = resolve_fhir_url(cli, profile)?;
    let client = FhirClient::new(&fhir_url, ctx.rest_header());
    let (res_type, id) = args
        .reference
        .split_once('/')
        .ok_or_else(|| CliError::UserError("reference must look like 'Type/id'".to_string()))?;
    let resource = client.read(res_type, id).await.map_err(|e| CliError::Other(anyhow::anyhow!(e.to_string())))?;
    output::print_resource(&resource);
    Ok(())
}

async fn run_bundle_command(args: &cli::BundleArgs) -> Result<(), CliError> {
    let source_dir = PathBuf::from(&args.source_dir);
    let mut entries = Vec::new();

    let mut read_dir = tokio::fs::read_dir(&source_dir).await.map_err(|e| CliError::Other(e.into()))?;
    while let Some(entry) = read_dir.next_entry().await.map_err(|e| CliError::Other(e.into()))? {
        let path = entry.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if !name.ends_with(".ndjson") && !name.ends_with(".ndjson.gz") {
            continue;
        }
        for resource in ndjson::read_values(&path).await.map_err(|e| CliError::Other(e.into()))? {
            entries.push(serde_json::json!({ "resource": resource }));
        }
    }

    let count = entries.len();
    let bundle = serde_json::json!({
        "resourceType": "Bundle",
        "type": "collection",
        "entry": entries,
    });
    tokio::fs::write(&args.output, serde_json::to_vec_pretty(&bundle).map_err(|e| CliError::Other(e.into()))?)
        .await
        .map_err(|e| CliError::Other(e.into()))?;

    output::print_success(&format!("Wrote {count} resources to {}.", args.output));
    Ok(())
}

async fn run_reset_symlinks_command(args: &cli::ResetSymlinksArgs) -> Result<(), CliError> {
    refresh_symlinks(Path::new(&args.dir)).await?;
    output::print_success("Symlinks refreshed.");
    Ok(())
}

/// Recomputes the flat numbered symlink view at `source_dir`'s root from its
/// subfolder history, for every resource type any subfolder's metadata
/// mentions.
async fn refresh_symlinks(source_dir: &Path) -> Result<(), CliError> {
    let workdirs = managed::list_workdirs(source_dir);
    let mut per_folder = Vec::with_capacity(workdirs.len());
    let mut all_types: BTreeSet<String> = BTreeSet::new();

    for entry in &workdirs {
        let meta = OutputMetadata::load(source_dir.join(&entry.folder)).await.map_err(|e| CliError::Other(e.into()))?;
        let filters = meta.filters().unwrap_or_default();
        all_types.extend(filters.keys().cloned());
        per_folder.push((entry.folder.clone(), filters, meta));
    }

    for res_type in &all_types {
        let contexts: Vec<symlinks::SubfolderContext> = per_folder
            .iter()
            .map(|(name, filters, meta)| symlinks::SubfolderContext {
                name: name.clone(),
                filters: filters.clone(),
                since: meta.done_for(res_type).map(str::to_string),
            })
            .collect();

        let mut active_oldest_first = symlinks::find_active_resource_workdirs(&contexts, res_type);
        active_oldest_first.reverse();

        let targets: Vec<PathBuf> = active_oldest_first
            .iter()
            .filter_map(|folder| {
                let plain = source_dir.join(folder).join(format!("{res_type}.ndjson"));
                if plain.exists() {
                    return Some(plain);
                }
                let gz = source_dir.join(folder).join(format!("{res_type}.ndjson.gz"));
                gz.exists().then_some(gz)
            })
            .collect();

        symlinks::rewrite_symlinks(source_dir, res_type, &targets).map_err(|e| CliError::Other(e.into()))?;
    }

    Ok(())
}
