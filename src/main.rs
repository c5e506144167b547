use anyhow::{Context as _, Result};
use chrondb::compaction::CompactionPolicy;
use chrondb::db::Database;
use chrondb::document::Document;
use chrondb::facade::WriteOptions;
use chrondb::index::ast::{Ast, Query, SortDirection, ValueType};
use chrondb::schema::Mode as SchemaMode;
use chrondb::temporal::{parse_timestamp, TemporalClause};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "chrondb",
    version,
    about = "Content-addressed, branch-aware document database"
)]
struct Cli {
    /// Database path
    #[arg(long, default_value = "chrondb.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save a document (JSON body, must contain "id")
    Save {
        branch: String,
        json: String,
        #[arg(short, long, default_value = "cli")]
        author: String,
        #[arg(long)]
        expected_version: Option<u64>,
        #[arg(long)]
        schema: Option<String>,
    },
    /// Fetch a document by id
    Get { branch: String, id: String },
    /// Delete a document by id
    Delete {
        branch: String,
        id: String,
        #[arg(short, long, default_value = "cli")]
        author: String,
    },
    /// List every document in a table
    Scan { branch: String, table: String },
    /// Show a document's commit history
    History { branch: String, id: String },
    /// Fetch a document as of a timestamp (RFC3339, bare date, or unix time)
    AsOf {
        branch: String,
        id: String,
        instant: String,
    },
    /// Show commit log for a branch
    Log { branch: String },
    /// Create a branch from an existing ref
    CreateBranch { name: String, from: String },
    /// Delete a branch
    DeleteBranch { name: String },
    /// List branches
    Branches,
    /// Exact-match search on a field within a branch
    Search {
        branch: String,
        field: String,
        value: String,
    },
    /// Sorted, paginated, resumable exact-match query on a field
    Query {
        branch: String,
        field: String,
        value: String,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        desc: bool,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(long)]
        after: Option<String>,
        #[arg(long)]
        allow_warming: bool,
    },
    /// Register a JSON Schema for a namespace
    RegisterSchema {
        branch: String,
        namespace: String,
        /// Path to a JSON Schema file
        schema_file: PathBuf,
        #[arg(long, value_enum, default_value = "strict")]
        mode: SchemaModeArg,
        #[arg(short, long, default_value = "cli")]
        author: String,
    },
    /// Export one or more branches to a bundle file
    ExportBundle {
        out: PathBuf,
        branches: Vec<String>,
        #[arg(long)]
        base_commit: Option<String>,
    },
    /// Import a bundle file
    ImportBundle {
        bundle: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Run retention-bounded garbage collection across branches
    Compact {
        branches: Vec<String>,
        #[arg(long, default_value = "0")]
        max_versions: usize,
        #[arg(long)]
        max_age_days: Option<u64>,
    },
    /// Show database statistics
    Stats,
}

#[derive(Clone, clap::ValueEnum)]
enum SchemaModeArg {
    Strict,
    Warning,
    Disabled,
}

impl From<SchemaModeArg> for SchemaMode {
    fn from(v: SchemaModeArg) -> Self {
        match v {
            SchemaModeArg::Strict => SchemaMode::Strict,
            SchemaModeArg::Warning => SchemaMode::Warning,
            SchemaModeArg::Disabled => SchemaMode::Disabled,
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Save {
            branch,
            json,
            author,
            expected_version,
            schema,
        } => cmd_save(&cli.db, &branch, &json, &author, expected_version, schema.as_deref()),
        Commands::Get { branch, id } => cmd_get(&cli.db, &branch, &id),
        Commands::Delete { branch, id, author } => cmd_delete(&cli.db, &branch, &id, &author),
        Commands::Scan { branch, table } => cmd_scan(&cli.db, &branch, &table),
        Commands::History { branch, id } => cmd_history(&cli.db, &branch, &id),
        Commands::AsOf { branch, id, instant } => cmd_as_of(&cli.db, &branch, &id, &instant),
        Commands::Log { branch } => cmd_log(&cli.db, &branch),
        Commands::CreateBranch { name, from } => cmd_create_branch(&cli.db, &name, &from),
        Commands::DeleteBranch { name } => cmd_delete_branch(&cli.db, &name),
        Commands::Branches => cmd_branches(&cli.db),
        Commands::Search { branch, field, value } => cmd_search(&cli.db, &branch, &field, &value),
        Commands::Query {
            branch,
            field,
            value,
            sort,
            desc,
            limit,
            offset,
            after,
            allow_warming,
        } => cmd_query(
            &cli.db,
            &branch,
            &field,
            &value,
            sort.as_deref(),
            desc,
            limit,
            offset,
            after.as_deref(),
            allow_warming,
        ),
        Commands::RegisterSchema {
            branch,
            namespace,
            schema_file,
            mode,
            author,
        } => cmd_register_schema(&cli.db, &branch, &namespace, &schema_file, mode.into(), &author),
        Commands::ExportBundle { out, branches, base_commit } => {
            cmd_export_bundle(&cli.db, &out, &branches, base_commit.as_deref())
        }
        Commands::ImportBundle { bundle, force } => cmd_import_bundle(&cli.db, &bundle, force),
        Commands::Compact { branches, max_versions, max_age_days } => {
            cmd_compact(&cli.db, &branches, max_versions, max_age_days)
        }
        Commands::Stats => cmd_stats(&cli.db),
    }
}

fn open(path: &Path) -> Result<Database> {
    Database::open(path).with_context(|| format!("opening database at {}", path.display()))
}

fn cmd_save(
    path: &Path,
    branch: &str,
    json: &str,
    author: &str,
    expected_version: Option<u64>,
    schema: Option<&str>,
) -> Result<()> {
    let db = open(path)?;
    let value: serde_json::Value = serde_json::from_str(json).context("parsing document JSON")?;
    let doc = Document::from_json(&value).context("document is missing \"id\"")?;
    let mut opts = WriteOptions::new(author);
    if let Some(v) = expected_version {
        opts = opts.with_expected_version(v);
    }
    if let Some(ns) = schema {
        opts = opts.with_schema_namespace(ns);
    }
    let saved = db.save(branch, doc, opts)?;
    println!("{}", serde_json::to_string_pretty(&saved.to_json())?);
    Ok(())
}

fn cmd_get(path: &Path, branch: &str, id: &str) -> Result<()> {
    let db = open(path)?;
    match db.get(branch, id)? {
        Some(doc) => println!("{}", serde_json::to_string_pretty(&doc.to_json())?),
        None => println!("(not found)"),
    }
    Ok(())
}

fn cmd_delete(path: &Path, branch: &str, id: &str, author: &str) -> Result<()> {
    let db = open(path)?;
    let existed = db.delete(branch, id, WriteOptions::new(author))?;
    println!("{}", if existed { "deleted" } else { "(not found)" });
    Ok(())
}

fn cmd_scan(path: &Path, branch: &str, table: &str) -> Result<()> {
    let db = open(path)?;
    let docs = db.get_by_table(branch, table)?;
    if docs.is_empty() {
        println!("(no documents)");
    }
    for doc in docs {
        println!("{}", serde_json::to_string(&doc.to_json())?);
    }
    Ok(())
}

fn cmd_history(path: &Path, branch: &str, id: &str) -> Result<()> {
    let db = open(path)?;
    let history = db.history(branch, id)?;
    if history.is_empty() {
        println!("(no history)");
    }
    for entry in history {
        let summary = match &entry.document {
            Some(_) => "saved",
            None => "deleted",
        };
        println!(
            "{} {} {} {}",
            &entry.commit_id[..entry.commit_id.len().min(8)],
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.committer,
            summary,
        );
    }
    Ok(())
}

fn cmd_as_of(path: &Path, branch: &str, id: &str, instant: &str) -> Result<()> {
    let db = open(path)?;
    let ts = parse_timestamp(instant)?;
    let docs = db.temporal_query(branch, id, &TemporalClause::AsOf(ts))?;
    match docs.first() {
        Some(doc) => println!("{}", serde_json::to_string_pretty(&doc.to_json())?),
        None => println!("(not found at that instant)"),
    }
    Ok(())
}

fn cmd_log(path: &Path, branch: &str) -> Result<()> {
    let db = open(path)?;
    let log = db.log(branch)?;
    if log.is_empty() {
        println!("(no commits yet)");
    }
    for commit in log {
        println!(
            "{} {} {}",
            &commit.id[..commit.id.len().min(8)],
            commit.timestamp.format("%Y-%m-%d %H:%M:%S"),
            commit.message,
        );
    }
    Ok(())
}

fn cmd_create_branch(path: &Path, name: &str, from: &str) -> Result<()> {
    let db = open(path)?;
    db.create_branch(name, from)?;
    println!("created branch '{}' from '{}'", name, from);
    Ok(())
}

fn cmd_delete_branch(path: &Path, name: &str) -> Result<()> {
    let db = open(path)?;
    db.delete_branch(name)?;
    println!("deleted branch '{}'", name);
    Ok(())
}

fn cmd_branches(path: &Path) -> Result<()> {
    let db = open(path)?;
    for branch in db.list_branches()? {
        println!("{}", branch);
    }
    Ok(())
}

fn cmd_search(path: &Path, branch: &str, field: &str, value: &str) -> Result<()> {
    let db = open(path)?;
    let ids = db.search(branch, &Ast::term(field, value));
    if ids.is_empty() {
        println!("(no matches)");
    }
    for id in ids {
        println!("{}", id);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_query(
    path: &Path,
    branch: &str,
    field: &str,
    value: &str,
    sort: Option<&str>,
    desc: bool,
    limit: Option<usize>,
    offset: usize,
    after: Option<&str>,
    allow_warming: bool,
) -> Result<()> {
    let db = open(path)?;
    let mut query = Query::new(branch, Ast::term(field, value));
    if let Some(sort_field) = sort {
        let dir = if desc { SortDirection::Desc } else { SortDirection::Asc };
        query.sort = vec![(sort_field.to_string(), dir, ValueType::String)];
    }
    query.limit = limit;
    query.offset = offset;
    query.after = after.map(str::to_string);
    query.hints.allow_warming = allow_warming;

    let results = db.search_query(&query);
    if results.ids.is_empty() {
        println!("(no matches)");
    }
    for id in &results.ids {
        println!("{}", id);
    }
    println!(
        "-- total: {}, limit: {:?}, offset: {}, after: {:?}",
        results.total, results.limit, results.offset, results.after
    );
    Ok(())
}

fn cmd_register_schema(
    path: &Path,
    branch: &str,
    namespace: &str,
    schema_file: &Path,
    mode: SchemaMode,
    author: &str,
) -> Result<()> {
    let db = open(path)?;
    let data = std::fs::read(schema_file)
        .with_context(|| format!("reading schema file {}", schema_file.display()))?;
    let schema: serde_json::Value = serde_json::from_slice(&data).context("parsing schema JSON")?;
    db.register_schema(branch, namespace, schema, mode, author)?;
    println!("registered schema for namespace '{}'", namespace);
    Ok(())
}

fn cmd_export_bundle(path: &Path, out: &Path, branches: &[String], base_commit: Option<&str>) -> Result<()> {
    let db = open(path)?;
    let mut file = File::create(out).with_context(|| format!("creating {}", out.display()))?;
    let manifest = db.export_bundle(branches, base_commit, &mut file)?;
    println!("exported {} ref(s) to {}", manifest.refs.len(), out.display());
    Ok(())
}

fn cmd_import_bundle(path: &Path, bundle: &Path, force: bool) -> Result<()> {
    let db = open(path)?;
    let mut file = File::open(bundle).with_context(|| format!("opening {}", bundle.display()))?;
    let manifest = db.import_bundle(&mut file, force)?;
    println!("imported {} ref(s)", manifest.refs.len());
    Ok(())
}

fn cmd_compact(path: &Path, branches: &[String], max_versions: usize, max_age_days: Option<u64>) -> Result<()> {
    let db = open(path)?;
    let policy = CompactionPolicy { max_versions, max_age_days };
    let result = db.compact(branches, &policy)?;
    print!("{}", result);
    Ok(())
}

fn cmd_stats(path: &Path) -> Result<()> {
    let db = open(path)?;
    let stats = db.stats()?;
    print!("{}", stats);
    Ok(())
}
