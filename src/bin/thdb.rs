use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;

use trailhead_dbops::database_ops::content::ContentType;
use trailhead_dbops::database_ops::db::Db;
use trailhead_dbops::database_ops::dedupe::{run_dedupe, run_plan, DedupeOptions};
use trailhead_dbops::database_ops::restore::restore_backup;
use trailhead_dbops::database_ops::schema_ops::{
    create_tmb_tables, drop_all_public, drop_tables, DEFAULT_TMB_DROP,
};
use trailhead_dbops::database_ops::snapshot::{
    backup_content, export_published_tmb, export_tables, output_path, read_json, timestamped_name,
    with_stage_count, write_json, Snapshot, TableBackup, TmbExport,
};
use trailhead_dbops::database_ops::transfer::{
    copy_tables, fix_sequences, import_snapshot, load_tmb_export, SequenceFix, COMPONENT_MEDIA_TABLES,
    TMB_TABLES,
};
use trailhead_dbops::database_ops::{hike_ids, inspect, media_dedupe, relink};
use trailhead_dbops::logging::init_tracing;
use trailhead_dbops::util::env::{env_parse, init_env, resolve_db_url};

#[derive(Parser, Debug)]
#[command(name = "thdb", version, about = "Trailhead CMS database operations")]
struct Cli {
    /// Postgres URL; overrides --target and DATABASE_URL
    #[arg(long, global = true)]
    db_url: Option<String>,
    /// Named connection (reads <NAME>_DATABASE_URL or <NAME>_DB_* from the environment)
    #[arg(long, global = true)]
    target: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TableGroup {
    Tmb,
    ComponentMedia,
}

impl TableGroup {
    fn tables(self) -> Vec<String> {
        let names = match self {
            TableGroup::Tmb => TMB_TABLES,
            TableGroup::ComponentMedia => COMPONENT_MEDIA_TABLES,
        };
        names.iter().map(|s| s.to_string()).collect()
    }
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// List public tables with their row counts
    Tables {
        /// Include empty tables
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Show a table's columns
    Describe { table: String },
    /// Draft/publish breakdown and duplicate groups for a content table
    DraftStatus { table: String },
    /// TMB stage and accommodation overview
    TmbSummary,
    /// Check accommodation -> stage relationships
    CheckStages,
    /// Back up a content table with its link rows and file links
    Backup {
        table: String,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Export whole tables to a JSON snapshot
    Export {
        #[arg(long, value_delimiter = ',', required = true)]
        tables: Vec<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Export published TMB stages and accommodations
    ExportTmb {
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Remove duplicate (document_id, locale) rows, keeping the newest
    Dedupe {
        table: String,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Skip the confirmation prompt
        #[arg(long, default_value_t = false)]
        yes: bool,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Execute a deletion plan written by `dedupe`
    ExecutePlan {
        plan: PathBuf,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Restore a content table from a backup file
    Restore {
        backup: PathBuf,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Truncate and reload tables from a snapshot file
    Import {
        snapshot: PathBuf,
        /// Import order (defaults to the snapshot's order)
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Copy tables from one target database to another
    Copy {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long, value_delimiter = ',', conflicts_with = "group")]
        tables: Option<Vec<String>>,
        #[arg(long, value_enum)]
        group: Option<TableGroup>,
        /// Also write the exported snapshot here
        #[arg(long)]
        save: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Move id sequences past MAX(id)
    FixSequences {
        #[arg(long, value_delimiter = ',', required = true)]
        tables: Vec<String>,
    },
    /// Repoint accommodations at published stages and rebuild the stage link table
    FixStageLinks {
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        yes: bool,
        /// Where the tmbaccommodations backup is written
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Pair draft and published TMB stages under one document_id
    FixStages {
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Copy stage links from published accommodations to their drafts
    SyncDraftLinks {
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Make the lowest id of each multi-row document its draft
    NormalizeDrafts {
        table: String,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Set hikes.hike_id from trails matched by name slug
    RemapHikeIds {
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Create the TMB tables if missing, optionally loading a TMB export
    CreateTables {
        /// File written by `export-tmb`
        #[arg(long)]
        import: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Drop tables (defaults to the TMB tables)
    DropTables {
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Drop every table in the public schema
    DropAllPublic,
    /// Remove duplicate images under <dir>/public/uploads
    DedupeMedia {
        dir: PathBuf,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

async fn connect(db_url: Option<&str>, target: Option<&str>) -> Result<Db> {
    let url = resolve_db_url(db_url, target)?;
    Db::connect(&url, env_parse("THDB_MAX_CONNS", 4u32)).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env();
    init_tracing("info")?;
    let cli = Cli::parse();
    let db_url = cli.db_url.as_deref();
    let target = cli.target.as_deref();

    match cli.command {
        Commands::Tables { all } => {
            let db = connect(db_url, target).await?;
            let counts = inspect::table_counts(&db, all).await?;
            print!("{}", inspect::render_table_counts(&counts));
        }
        Commands::Describe { table } => {
            let db = connect(db_url, target).await?;
            let cols = inspect::describe_table(&db, &table).await?;
            print!("{}", inspect::render_columns(&table, &cols));
        }
        Commands::DraftStatus { table } => {
            let db = connect(db_url, target).await?;
            let status = inspect::draft_status(&db, &table).await?;
            print!("{}", inspect::render_draft_status(&status));
        }
        Commands::TmbSummary => {
            let db = connect(db_url, target).await?;
            let summary = inspect::tmb_summary(&db).await?;
            print!("{}", inspect::render_tmb_summary(&summary));
        }
        Commands::CheckStages => {
            let db = connect(db_url, target).await?;
            let check = inspect::stage_relationship_check(&db).await?;
            print!("{}", inspect::render_stage_check(&check));
        }
        Commands::Backup { table, out_dir } => {
            let content = ContentType::resolve(&table)?;
            let db = connect(db_url, target).await?;
            let backup = backup_content(&db, &content).await?;
            let path = output_path(
                out_dir.as_deref(),
                &timestamped_name(&format!("{table}_backup"), "json"),
            );
            write_json(&path, &backup)?;
            println!(
                "Backed up {} rows, {} link rows, {} file links to {}",
                backup.total_rows,
                backup.link_row_count(),
                backup.file_links.len(),
                path.display()
            );
        }
        Commands::Export { tables, out } => {
            let db = connect(db_url, target).await?;
            let snapshot = export_tables(&db, &tables, target.map(str::to_string)).await?;
            let path = out.unwrap_or_else(|| PathBuf::from(timestamped_name("snapshot", "json")));
            write_json(&path, &snapshot)?;
            println!(
                "Exported {} tables ({} rows) to {}",
                snapshot.tables.len(),
                snapshot.row_count(),
                path.display()
            );
        }
        Commands::ExportTmb { out_dir } => {
            let db = connect(db_url, target).await?;
            let export = export_published_tmb(&db).await?;
            let path = output_path(out_dir.as_deref(), &timestamped_name("tmb_export", "json"));
            write_json(&path, &export)?;
            println!("Stages: {}", export.tmb_stages.len());
            println!(
                "Accommodations: {} ({} with a stage)",
                export.tmb_accommodations.len(),
                with_stage_count(&export)
            );
            println!("Written to {}", path.display());
        }
        Commands::Dedupe {
            table,
            dry_run,
            yes,
            out_dir,
        } => {
            let content = ContentType::resolve(&table)?;
            let db = connect(db_url, target).await?;
            let opts = DedupeOptions {
                dry_run,
                assume_yes: yes,
                out_dir,
            };
            let report = run_dedupe(&db, &content, &opts).await?;
            if report.verification.as_ref().is_some_and(|v| !v.is_clean()) {
                bail!("verification failed for {table}");
            }
        }
        Commands::ExecutePlan { plan, yes } => {
            let db = connect(db_url, target).await?;
            let report = run_plan(&db, &plan, yes).await?;
            if report.verification.as_ref().is_some_and(|v| !v.is_clean()) {
                bail!("verification failed after executing {}", plan.display());
            }
        }
        Commands::Restore { backup, yes } => {
            let backup: TableBackup = read_json(&backup)?;
            let db = connect(db_url, target).await?;
            let report = restore_backup(&db, &backup, yes).await?;
            if report.applied && !report.counts_match() {
                bail!("restore of {} finished with count mismatches", backup.table);
            }
        }
        Commands::Import {
            snapshot,
            tables,
            yes,
        } => {
            let snapshot: Snapshot = read_json(&snapshot)?;
            let db = connect(db_url, target).await?;
            let report = import_snapshot(&db, &snapshot, tables.as_deref(), yes).await?;
            if report.applied {
                println!(
                    "Imported {} rows into {} tables",
                    report.total_inserted(),
                    report.inserted.len()
                );
            }
        }
        Commands::Copy {
            from,
            to,
            tables,
            group,
            save,
            yes,
        } => {
            let tables = match (tables, group) {
                (Some(t), _) => t,
                (None, Some(g)) => g.tables(),
                (None, None) => bail!("copy needs --tables or --group"),
            };
            if from == to {
                bail!("--from and --to name the same target");
            }
            let source = connect(None, Some(&from)).await?;
            let dest = connect(None, Some(&to)).await?;
            let report = copy_tables(&source, &dest, &tables, Some(from.clone()), save.as_deref(), yes).await?;
            if report.applied {
                for (table, n) in &report.inserted {
                    println!("  {table}: {n}");
                }
                println!("Copied {} rows from {from} to {to}", report.total_inserted());
            }
        }
        Commands::FixSequences { tables } => {
            let db = connect(db_url, target).await?;
            for fix in fix_sequences(&db, &tables).await? {
                match fix {
                    SequenceFix::Set { table, next_id } => println!("{table}: next id {next_id}"),
                    SequenceFix::Empty { table } => println!("{table}: empty, skipped"),
                    SequenceFix::NoSequence { table } => println!("{table}: no id sequence"),
                    SequenceFix::Failed { table, error } => println!("{table}: FAILED ({error})"),
                }
            }
        }
        Commands::FixStageLinks {
            dry_run,
            yes,
            out_dir,
        } => {
            let db = connect(db_url, target).await?;
            let report = relink::fix_stage_links(&db, dry_run, yes, out_dir.as_deref()).await?;
            println!("Draft->published stage mappings: {}", report.mappings);
            if let Some(path) = &report.backup_file {
                println!("Backup saved to {}", path.display());
            }
            if report.applied {
                println!("Accommodations repointed: {}", report.repointed);
                println!("Links deleted: {}", report.links_deleted);
                println!("Links created: {}", report.links_created);
            } else if dry_run {
                println!("Would repoint {} accommodations (dry run)", report.repointed);
            }
            println!("Published accommodations on draft stages: {}", report.draft_pointers_left);
            println!(
                "Published links: {} ({} accommodations, {} stages)",
                report.published_links.total_links,
                report.published_links.unique_accommodations,
                report.published_links.unique_stages
            );
            if report.applied && report.draft_pointers_left > 0 {
                bail!("stage links still point at draft stages");
            }
        }
        Commands::FixStages { dry_run, yes } => {
            let db = connect(db_url, target).await?;
            let report = relink::fix_stage_documents(&db, dry_run, yes).await?;
            for fix in &report.fixes {
                println!(
                    "Stage {}: ids {:?} -> {}{}",
                    fix.stage_number,
                    fix.ids,
                    fix.document_id,
                    if fix.generated { " (generated)" } else { "" }
                );
            }
            for (stage, rows) in &report.skipped {
                println!("Stage {stage}: {rows} rows, skipped");
            }
            if let Some(after) = &report.after {
                println!("Updated {} rows", report.rows_updated);
                print!("{}", inspect::render_draft_status(after));
            }
        }
        Commands::SyncDraftLinks { dry_run } => {
            let db = connect(db_url, target).await?;
            let report = relink::sync_draft_links(&db, dry_run).await?;
            println!("Draft links to add: {}", report.candidates.len());
            if report.applied {
                println!("Synced: {}", report.synced);
            }
            println!("Remaining mismatches: {}", report.remaining);
        }
        Commands::NormalizeDrafts {
            table,
            dry_run,
            yes,
        } => {
            let content = ContentType::resolve(&table)?;
            let db = connect(db_url, target).await?;
            let report = relink::normalize_drafts(&db, &content, dry_run, yes).await?;
            println!("Before:");
            print!("{}", inspect::render_draft_status(&report.before));
            println!("Rows to mark as draft: {}", report.planned);
            if let Some(after) = &report.after {
                println!("After ({} rows updated):", report.drafts_set);
                print!("{}", inspect::render_draft_status(after));
                if report.matches_draft_publish_pattern() {
                    println!("One draft per document");
                } else {
                    warn!(table = %table, "table does not match the draft/publish pattern");
                }
            }
        }
        Commands::RemapHikeIds { dry_run, yes } => {
            let db = connect(db_url, target).await?;
            let report = hike_ids::remap_hike_ids(&db, dry_run, yes).await?;
            println!(
                "Matched {} of {} hikes against {} trail slugs",
                report.matched.len(),
                report.hikes,
                report.trails
            );
            if report.applied {
                println!("Updated hike_id for {} rows", report.updated);
            }
        }
        Commands::CreateTables { import, yes } => {
            let export: Option<TmbExport> = import.as_deref().map(read_json::<TmbExport>).transpose()?;
            let db = connect(db_url, target).await?;
            let report = create_tmb_tables(&db).await?;
            for table in &report.created {
                println!("Created {table}");
            }
            for table in &report.already_present {
                println!("{table} already exists");
            }
            if let Some(export) = export {
                let loaded = load_tmb_export(&db, &export, yes).await?;
                if loaded.applied {
                    println!("Stages: {}", loaded.stages);
                    println!("Accommodations: {}", loaded.accommodations);
                    println!("Stage links: {}", loaded.links);
                    if loaded.unmapped_links > 0 {
                        println!("Accommodations with an unknown stage: {}", loaded.unmapped_links);
                    }
                }
            }
        }
        Commands::DropTables { tables, yes } => {
            let tables =
                tables.unwrap_or_else(|| DEFAULT_TMB_DROP.iter().map(|s| s.to_string()).collect());
            let db = connect(db_url, target).await?;
            let report = drop_tables(&db, &tables, yes).await?;
            for (table, err) in &report.failed {
                println!("{table}: FAILED ({err})");
            }
            if report.applied {
                println!("Dropped {} tables", report.dropped.len());
            }
        }
        Commands::DropAllPublic => {
            let db = connect(db_url, target).await?;
            let report = drop_all_public(&db).await?;
            for (table, err) in &report.failed {
                println!("{table}: FAILED ({err})");
            }
            if report.applied {
                println!("Dropped {} tables, {} failed", report.dropped.len(), report.failed.len());
            }
        }
        Commands::DedupeMedia { dir, dry_run, yes } => {
            let report = media_dedupe::run(&dir, dry_run, yes)?;
            println!("Scanned {} images", report.scanned);
            println!("Found {} sets of duplicates", report.duplicate_sets.len());
            if dry_run {
                println!("Would remove {} files", report.planned_removals());
            } else {
                println!("Removed {} duplicate files", report.removed);
            }
            if report.errors > 0 {
                println!("{} errors", report.errors);
            }
        }
    }
    Ok(())
}
